//! Downstream (vehicle bus) provider seam
//!
//! The gateway forwards the UDS bytes of accepted diagnostic messages to a
//! provider that terminates them on the vehicle side. Providers answer
//! through a [`DownstreamSink`]: responses are posted onto the owning
//! connection's event queue and handled there, never by calling back into
//! connection state from a foreign task.

pub mod mock;

#[cfg(all(target_os = "linux", feature = "isotp"))]
pub mod isotp;

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::error::GatewayError;

/// Outcome of handing a request to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamResult {
    /// The provider will answer through the sink later
    Pending,
    /// The exchange is complete, nothing more will arrive
    Handled,
    /// The provider refused the request
    Error,
    /// The provider gave up waiting on the bus
    Timeout,
}

impl fmt::Display for DownstreamResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A provider's answer, delivered onto the connection task.
#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub payload: Vec<u8>,
    pub result: DownstreamResult,
}

/// Write-end of a connection's downstream response queue.
///
/// Cloneable and safe to call from any task. Responses arriving after the
/// connection closed are dropped silently.
#[derive(Clone)]
pub struct DownstreamSink {
    tx: UnboundedSender<DownstreamResponse>,
}

impl DownstreamSink {
    pub(crate) fn new(tx: UnboundedSender<DownstreamResponse>) -> Self {
        Self { tx }
    }

    pub fn respond(&self, payload: Vec<u8>, result: DownstreamResult) {
        if self
            .tx
            .send(DownstreamResponse { payload, result })
            .is_err()
        {
            debug!("Downstream response after connection close, dropped");
        }
    }
}

/// A component that terminates UDS traffic on the vehicle bus.
///
/// `dispatch` must not block: providers that talk to a real bus spawn the
/// exchange and return [`DownstreamResult::Pending`].
pub trait DownstreamProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Bring up bus resources. Called once before the first dispatch.
    fn start(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Release bus resources.
    fn stop(&self) {}

    /// Forward one UDS request.
    fn dispatch(&self, request: &[u8], sink: DownstreamSink) -> DownstreamResult;
}
