//! Server model: per-connection configuration and callback hooks
//!
//! The server hands every accepted connection a fresh model produced by a
//! [`ModelFactory`], so models can carry per-connection state without
//! shared mutation. All hooks run on the connection task and must not
//! block.

use std::sync::Arc;

use tracing::debug;

use doip_wire::{DiagnosticNackCode, DoipMessage, LogicalAddress};

use crate::connection::CloseReason;
use crate::downstream::{DownstreamProvider, DownstreamResult, DownstreamSink};

/// Snapshot of connection identity passed to model hooks.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Transport identifier (peer address or mock name)
    pub identifier: String,
    /// Routed client address, once activation succeeded
    pub client_address: Option<LogicalAddress>,
}

/// Application-side view of a connection.
///
/// Every hook has a default so models only implement what they care
/// about. `on_diagnostic_message` may veto a message by returning a
/// negative acknowledge code; `None` means the gateway acks positively.
pub trait ServerModel: Send {
    fn name(&self) -> &str {
        "default"
    }

    /// Logical address the gateway answers under.
    fn server_address(&self) -> LogicalAddress;

    fn on_open_connection(&mut self, info: &ConnectionInfo) {
        let _ = info;
    }

    /// Inspect an accepted diagnostic message before it is acknowledged.
    fn on_diagnostic_message(
        &mut self,
        info: &ConnectionInfo,
        msg: &DoipMessage,
    ) -> Option<DiagnosticNackCode> {
        let _ = (info, msg);
        None
    }

    /// Called after the positive or negative ack went out.
    fn on_diagnostic_notification(
        &mut self,
        info: &ConnectionInfo,
        ack: Option<DiagnosticNackCode>,
    ) {
        let _ = (info, ack);
    }

    /// Whether diagnostic payloads are forwarded to a vehicle bus.
    fn has_downstream(&self) -> bool {
        false
    }

    /// Forward an acknowledged diagnostic message downstream. Only called
    /// when [`Self::has_downstream`] returns true.
    fn on_downstream_request(
        &mut self,
        info: &ConnectionInfo,
        msg: &DoipMessage,
        sink: DownstreamSink,
    ) -> DownstreamResult {
        let _ = (info, msg, sink);
        DownstreamResult::Error
    }

    fn on_close_connection(&mut self, info: &ConnectionInfo, reason: CloseReason) {
        let _ = (info, reason);
    }
}

/// Produces a fresh model per accepted connection.
pub type ModelFactory = Arc<dyn Fn() -> Box<dyn ServerModel> + Send + Sync>;

/// Model that acknowledges every diagnostic message and forwards nothing.
pub struct DefaultServerModel {
    server_address: LogicalAddress,
}

impl DefaultServerModel {
    pub fn new(server_address: LogicalAddress) -> Self {
        Self { server_address }
    }
}

impl ServerModel for DefaultServerModel {
    fn server_address(&self) -> LogicalAddress {
        self.server_address
    }
}

/// Model that forwards acknowledged diagnostic messages to a
/// [`DownstreamProvider`].
pub struct DownstreamServerModel {
    name: String,
    server_address: LogicalAddress,
    provider: Arc<dyn DownstreamProvider>,
}

impl DownstreamServerModel {
    pub fn new(
        name: &str,
        server_address: LogicalAddress,
        provider: Arc<dyn DownstreamProvider>,
    ) -> Self {
        Self {
            name: name.to_string(),
            server_address,
            provider,
        }
    }
}

impl ServerModel for DownstreamServerModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn server_address(&self) -> LogicalAddress {
        self.server_address
    }

    fn has_downstream(&self) -> bool {
        true
    }

    fn on_downstream_request(
        &mut self,
        info: &ConnectionInfo,
        msg: &DoipMessage,
        sink: DownstreamSink,
    ) -> DownstreamResult {
        let Some(request) = msg.user_data() else {
            return DownstreamResult::Error;
        };
        debug!(
            peer = %info.identifier,
            provider = self.provider.name(),
            bytes = request.len(),
            "Forwarding request downstream"
        );
        self.provider.dispatch(request, sink)
    }
}
