//! Byte transport abstraction
//!
//! Two seams decouple the core from concrete sockets:
//!
//! - [`ServerTransport`]: the listening side — TCP accept, the shared UDP
//!   discovery socket and vehicle announcements.
//! - [`ConnectionTransport`]: one framed DoIP byte stream per peer.
//!
//! The connection state machine is written purely against
//! `ConnectionTransport`; tests substitute the in-memory mock for the TCP
//! implementation.

pub mod mock;
pub mod tcp;

use std::net::SocketAddr;

use async_trait::async_trait;

use doip_wire::DoipMessage;

use crate::connection::CloseReason;
use crate::error::TransportError;

/// Per-peer framed transport.
///
/// `receive` blocks until one complete DoIP frame is available and performs
/// the header-then-payload read itself, so the state machine only ever sees
/// whole validated messages.
#[async_trait]
pub trait ConnectionTransport: Send {
    /// Send one message. Returns the number of bytes written.
    async fn send(&mut self, msg: &DoipMessage) -> Result<usize, TransportError>;

    /// Receive one framed message. `Ok(None)` means the peer disconnected;
    /// `Err` is a socket failure or a protocol violation in the frame.
    async fn receive(&mut self) -> Result<Option<DoipMessage>, TransportError>;

    /// Close the transport. Idempotent.
    async fn close(&mut self, reason: CloseReason);

    fn is_active(&self) -> bool;

    /// Human-readable peer identifier for logging
    /// (e.g. "192.168.1.10:54321", "mock:client-1").
    fn identifier(&self) -> String;
}

/// Listening transport owned by the server.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Bind and listen. Must be called once before any other operation.
    async fn setup(&self) -> Result<(), TransportError>;

    /// Next accepted connection, or `None` when nothing is pending.
    async fn accept(&self) -> Option<Box<dyn ConnectionTransport>>;

    /// Transmit via UDP to the configured broadcast/loopback address.
    async fn send_broadcast(
        &self,
        msg: &DoipMessage,
        dest_port: u16,
    ) -> Result<usize, TransportError>;

    /// Next datagram on the discovery socket, or `None` when nothing
    /// arrived within the poll interval.
    async fn recv_datagram(&self) -> Option<(Vec<u8>, SocketAddr)>;

    /// Unicast reply on the discovery socket.
    async fn send_datagram(
        &self,
        msg: &DoipMessage,
        dest: SocketAddr,
    ) -> Result<usize, TransportError>;

    /// Close listener and discovery sockets. Idempotent.
    fn close(&self);

    fn is_active(&self) -> bool;

    fn identifier(&self) -> String;

    /// Bound TCP listener address, once set up. Lets tests bind port 0.
    fn local_addr(&self) -> Option<SocketAddr>;
}
