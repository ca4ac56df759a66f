//! DoIP gateway server core
//!
//! A Diagnostics-over-IP (ISO 13400-2) gateway: announces a vehicle on the
//! local segment via UDP, accepts diagnostic clients over TCP, and brokers
//! UDS payloads between those clients and a downstream vehicle bus.
//!
//! The building blocks, leaves first:
//!
//! - [`timer::TimerManager`] is shared across connections and drives their
//!   time-based transitions; expiries are delivered onto the owning
//!   connection's task through per-connection scoped handles.
//! - [`transport`] decouples the core from concrete sockets: TCP
//!   implementations for production, in-memory mocks for tests.
//! - [`connection::Connection`] is the per-client state machine: routing
//!   activation, diagnostic exchange, alive checks, downstream dispatch.
//! - [`server::DoipServer`] owns the listening transport, spawns one task
//!   per connection and runs the announcement and identification loops.
//! - [`model::ServerModel`] and [`downstream::DownstreamProvider`] are the
//!   seams the embedding application plugs into.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use doip_gateway::config::ServerConfig;
//! use doip_gateway::model::DefaultServerModel;
//! use doip_gateway::server::DoipServer;
//!
//! # async fn run() -> Result<(), doip_gateway::error::GatewayError> {
//! let config = ServerConfig {
//!     vin: "WAUZZZ8V9KA123456".into(),
//!     logical_address: 0x0028,
//!     ..ServerConfig::default()
//! };
//! let address = config.logical_address;
//! let server = DoipServer::with_tcp(config)?;
//! server.setup().await?;
//! server.start(Arc::new(move || Box::new(DefaultServerModel::new(address))));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod downstream;
pub mod error;
pub mod model;
pub mod server;
pub mod timer;
pub mod transport;

pub use config::{ServerConfig, TimerConfig};
pub use connection::{CloseReason, Connection, ConnectionState};
pub use downstream::{DownstreamProvider, DownstreamResult, DownstreamSink};
pub use error::{GatewayError, TransportError};
pub use model::{DefaultServerModel, DownstreamServerModel, ModelFactory, ServerModel};
pub use server::DoipServer;
pub use timer::{TimerHandle, TimerId, TimerManager};
