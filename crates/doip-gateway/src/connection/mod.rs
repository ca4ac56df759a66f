//! Per-connection DoIP state machine
//!
//! A [`Connection`] owns one transport, one server model and a scoped
//! handle onto the server's shared timer manager. [`Connection::run`] is a
//! select loop over the transport, timer
//! expiries, downstream responses and the server stop signal; every event
//! is handled to quiescence before the next one is taken, so state
//! transitions never race.
//!
//! State flow (terminal state is `Closed`):
//!
//! ```text
//! WaitRoutingActivation --activation ok--> RoutingActivated
//!   RoutingActivated --general inactivity--> WaitAliveCheckResponse
//!   RoutingActivated --diag msg, downstream pending--> WaitDownstreamResponse
//!   WaitAliveCheckResponse --response/diag--> RoutingActivated
//!   WaitDownstreamResponse --response/timeout--> RoutingActivated
//! ```

mod state;

pub use state::{CloseReason, ConnectionState, StateBehavior};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use doip_wire::{
    is_valid_source_address, DiagnosticNackCode, DoipMessage, LogicalAddress, PayloadType,
    RoutingResponseCode,
};

use crate::config::TimerConfig;
use crate::downstream::{DownstreamResponse, DownstreamResult, DownstreamSink};
use crate::error::TransportError;
use crate::model::{ConnectionInfo, ServerModel};
use crate::timer::{ExpirySender, TimerHandle, TimerId, TimerManager};
use crate::transport::ConnectionTransport;

enum Step {
    Transport(Result<Option<DoipMessage>, TransportError>),
    Timer(TimerId),
    Downstream(DownstreamResponse),
    Stop,
}

/// One client connection and its state machine.
pub struct Connection {
    transport: Box<dyn ConnectionTransport>,
    model: Box<dyn ServerModel>,
    timers: TimerHandle,
    timer_cfg: TimerConfig,
    state: ConnectionState,
    client_address: Option<LogicalAddress>,
    alive_check_retry: u32,
    closing: bool,
    identifier: String,
    timer_tx: ExpirySender,
    timer_rx: Option<UnboundedReceiver<TimerId>>,
    downstream_tx: UnboundedSender<DownstreamResponse>,
    downstream_rx: Option<UnboundedReceiver<DownstreamResponse>>,
}

impl Connection {
    /// Wrap an accepted transport, scoping this connection's timers within
    /// the shared manager. The connection starts in `WaitRoutingActivation`
    /// with the initial inactivity timer armed.
    pub fn new(
        transport: Box<dyn ConnectionTransport>,
        mut model: Box<dyn ServerModel>,
        timers: Arc<TimerManager>,
        timer_cfg: TimerConfig,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (downstream_tx, downstream_rx) = mpsc::unbounded_channel();
        let identifier = transport.identifier();

        model.on_open_connection(&ConnectionInfo {
            identifier: identifier.clone(),
            client_address: None,
        });

        let mut connection = Self {
            transport,
            model,
            timers: TimerHandle::register(&timers),
            timer_cfg,
            state: ConnectionState::WaitRoutingActivation,
            client_address: None,
            alive_check_retry: 0,
            closing: false,
            identifier,
            timer_tx,
            timer_rx: Some(timer_rx),
            downstream_tx,
            downstream_rx: Some(downstream_rx),
        };
        connection.start_state_timer();
        connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_address(&self) -> Option<LogicalAddress> {
        self.client_address
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            identifier: self.identifier.clone(),
            client_address: self.client_address,
        }
    }

    /// Drive the connection until it closes.
    ///
    /// Events are linearized: one message, expiry or downstream response is
    /// handled completely before the next is taken. The stop signal closes
    /// with `ApplicationRequest`.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) {
        let Some(mut timer_rx) = self.timer_rx.take() else {
            return;
        };
        let Some(mut downstream_rx) = self.downstream_rx.take() else {
            return;
        };

        while self.state != ConnectionState::Closed {
            if *stop.borrow() {
                self.close(CloseReason::ApplicationRequest).await;
                break;
            }
            let step = tokio::select! {
                result = self.transport.receive() => Step::Transport(result),
                Some(id) = timer_rx.recv() => Step::Timer(id),
                Some(response) = downstream_rx.recv() => Step::Downstream(response),
                _ = stop.changed() => Step::Stop,
            };
            match step {
                Step::Transport(Ok(Some(msg))) => self.handle_message(msg).await,
                Step::Transport(Ok(None)) => self.close(CloseReason::PeerDisconnect).await,
                Step::Transport(Err(e)) => {
                    warn!(peer = %self.identifier, %e, "Receive failed");
                    let reason = match e {
                        TransportError::Protocol(_) => CloseReason::InvalidMessage,
                        _ => CloseReason::SocketError,
                    };
                    self.close(reason).await;
                }
                Step::Timer(id) => self.handle_timeout(id).await,
                Step::Downstream(response) => self.handle_downstream_response(response).await,
                Step::Stop => self.close(CloseReason::ApplicationRequest).await,
            }
        }
    }

    /// Dispatch one received message according to the current state.
    async fn handle_message(&mut self, msg: DoipMessage) {
        debug!(peer = %self.identifier, state = %self.state, "RX {msg}");
        match self.state {
            ConnectionState::WaitRoutingActivation => {
                self.handle_wait_routing_activation(msg).await
            }
            ConnectionState::RoutingActivated => self.handle_routing_activated(msg).await,
            ConnectionState::WaitAliveCheckResponse => self.handle_wait_alive_check(msg).await,
            ConnectionState::WaitDownstreamResponse => {
                // Client messages are not processed while a downstream
                // exchange is in flight.
                warn!(peer = %self.identifier, "Dropping {msg} while awaiting downstream response");
            }
            ConnectionState::SocketInitialized
            | ConnectionState::Finalize
            | ConnectionState::Closed => {
                debug!(peer = %self.identifier, "Ignoring {msg} in state {}", self.state);
            }
        }
    }

    async fn handle_wait_routing_activation(&mut self, msg: DoipMessage) {
        if msg.payload_type() != PayloadType::RoutingActivationRequest {
            warn!(peer = %self.identifier, "Expected routing activation request, got {msg}");
            self.close(CloseReason::InvalidMessage).await;
            return;
        }
        let Some(source) = msg.source_address() else {
            warn!(peer = %self.identifier, "Routing activation request without source address");
            self.close(CloseReason::InvalidMessage).await;
            return;
        };
        if !is_valid_source_address(source) {
            warn!(
                peer = %self.identifier,
                source = format_args!("0x{source:04X}"),
                "Source address outside the tester range"
            );
            let response = DoipMessage::routing_activation_response(
                source,
                self.model.server_address(),
                RoutingResponseCode::DeniedUnknownSourceAddress,
            );
            self.send(&response).await;
            self.close(CloseReason::InvalidMessage).await;
            return;
        }

        self.client_address = Some(source);
        let response = DoipMessage::routing_activation_response(
            source,
            self.model.server_address(),
            RoutingResponseCode::RouteActivated,
        );
        self.send(&response).await;
        info!(
            peer = %self.identifier,
            client = format_args!("0x{source:04X}"),
            "Routing activated"
        );
        self.transition_to(ConnectionState::RoutingActivated);
    }

    async fn handle_routing_activated(&mut self, msg: DoipMessage) {
        match msg.payload_type() {
            PayloadType::DiagnosticMessage => self.process_diagnostic_message(msg).await,
            PayloadType::AliveCheckResponse => {
                if let Err(e) = self.timers.restart_timer(TimerId::GeneralInactivity) {
                    warn!(peer = %self.identifier, %e, "Failed to restart inactivity timer");
                }
            }
            other => {
                warn!(peer = %self.identifier, "Unsupported payload type {other} while activated");
                self.send_diagnostic_ack(Some(DiagnosticNackCode::TransportProtocolError))
                    .await;
            }
        }
    }

    /// Accepted diagnostic message: validate the source, let the model
    /// veto, ack, then forward downstream.
    async fn process_diagnostic_message(&mut self, msg: DoipMessage) {
        let Some(source) = msg.source_address() else {
            self.close(CloseReason::InvalidMessage).await;
            return;
        };
        if self.client_address != Some(source) {
            warn!(
                peer = %self.identifier,
                source = format_args!("0x{source:04X}"),
                "Diagnostic message from unexpected source address"
            );
            self.send_diagnostic_ack(Some(DiagnosticNackCode::InvalidSourceAddress))
                .await;
            return;
        }

        let info = self.info();
        let ack = self.model.on_diagnostic_message(&info, &msg);
        self.send_diagnostic_ack(ack).await;

        if let Err(e) = self.timers.restart_timer(TimerId::GeneralInactivity) {
            warn!(peer = %self.identifier, %e, "Failed to restart inactivity timer");
        }

        if ack.is_some() {
            return;
        }

        if self.model.has_downstream() {
            let sink = DownstreamSink::new(self.downstream_tx.clone());
            let result = self.model.on_downstream_request(&info, &msg, sink);
            debug!(peer = %self.identifier, %result, "Downstream request");
            match result {
                DownstreamResult::Pending => {
                    self.transition_to(ConnectionState::WaitDownstreamResponse);
                }
                DownstreamResult::Handled => {}
                DownstreamResult::Error | DownstreamResult::Timeout => {
                    self.send_diagnostic_ack(Some(DiagnosticNackCode::TargetUnreachable))
                        .await;
                }
            }
        }
    }

    async fn handle_wait_alive_check(&mut self, msg: DoipMessage) {
        match msg.payload_type() {
            PayloadType::AliveCheckResponse | PayloadType::DiagnosticMessage => {
                debug!(peer = %self.identifier, "Client is alive");
                self.transition_to(ConnectionState::RoutingActivated);
            }
            other => {
                warn!(
                    peer = %self.identifier,
                    "Unsupported payload type {other} while awaiting alive check"
                );
                self.send_diagnostic_ack(Some(DiagnosticNackCode::TransportProtocolError))
                    .await;
            }
        }
    }

    async fn handle_timeout(&mut self, id: TimerId) {
        // A timer may fire just as the state changes; expiries that no
        // longer match the state's timer are stale.
        if self.state.behavior().timer != Some(id) {
            debug!(peer = %self.identifier, %id, "Stale timer expiry, ignored");
            return;
        }
        warn!(peer = %self.identifier, %id, "Timeout");

        match id {
            TimerId::InitialInactivity => {
                self.close(CloseReason::InitialInactivityTimeout).await;
            }
            TimerId::GeneralInactivity => {
                self.send(&DoipMessage::alive_check_request()).await;
                self.transition_to(ConnectionState::WaitAliveCheckResponse);
            }
            TimerId::AliveCheck => {
                if self.alive_check_retry < self.timer_cfg.alive_check_retries {
                    self.alive_check_retry += 1;
                    warn!(
                        peer = %self.identifier,
                        "Alive check attempt {}/{}",
                        self.alive_check_retry,
                        self.timer_cfg.alive_check_retries
                    );
                    self.send(&DoipMessage::alive_check_request()).await;
                    self.arm_timer(TimerId::AliveCheck);
                } else {
                    self.close(CloseReason::AliveCheckTimeout).await;
                }
            }
            TimerId::DownstreamResponse => {
                self.send_diagnostic_ack(Some(DiagnosticNackCode::TargetUnreachable))
                    .await;
                self.transition_to(ConnectionState::RoutingActivated);
            }
            TimerId::UserDefined => {
                warn!(peer = %self.identifier, "Unhandled user-defined timer expiry");
            }
        }
    }

    /// Downstream response delivered onto the connection task.
    async fn handle_downstream_response(&mut self, response: DownstreamResponse) {
        if self.state != ConnectionState::WaitDownstreamResponse {
            debug!(peer = %self.identifier, "Late downstream response, dropped");
            return;
        }
        debug!(
            peer = %self.identifier,
            result = %response.result,
            bytes = response.payload.len(),
            "Downstream response"
        );
        match response.result {
            DownstreamResult::Handled => {
                let msg = DoipMessage::diagnostic_message(
                    self.model.server_address(),
                    self.client_address.unwrap_or(0),
                    &response.payload,
                );
                self.send(&msg).await;
            }
            _ => {
                self.send_diagnostic_ack(Some(DiagnosticNackCode::TargetUnreachable))
                    .await;
            }
        }
        self.transition_to(ConnectionState::RoutingActivated);
    }

    /// Close the connection. Idempotent: the first call stops all timers,
    /// closes the transport and notifies the model exactly once.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.closing {
            debug!(peer = %self.identifier, "Close already in progress");
            return;
        }
        self.closing = true;
        info!(peer = %self.identifier, %reason, "Closing connection");

        self.timers.stop_all();
        self.transport.close(reason).await;
        self.state = ConnectionState::Closed;

        let info = self.info();
        self.model.on_close_connection(&info, reason);
    }

    fn transition_to(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(peer = %self.identifier, "State {} -> {next}", self.state);
        self.state = next;
        self.start_state_timer();

        match next {
            ConnectionState::RoutingActivated => {
                self.alive_check_retry = 0;
            }
            ConnectionState::WaitAliveCheckResponse => {
                self.alive_check_retry += 1;
                warn!(
                    peer = %self.identifier,
                    "Alive check attempt {}/{}",
                    self.alive_check_retry,
                    self.timer_cfg.alive_check_retries
                );
            }
            ConnectionState::Finalize => {
                self.state = ConnectionState::Closed;
            }
            _ => {}
        }
    }

    fn timer_duration(&self, id: TimerId) -> Duration {
        match id {
            TimerId::InitialInactivity => self.timer_cfg.initial_inactivity(),
            TimerId::GeneralInactivity => self.timer_cfg.general_inactivity(),
            TimerId::AliveCheck => self.timer_cfg.alive_check(),
            TimerId::DownstreamResponse => self.timer_cfg.downstream_response(),
            TimerId::UserDefined => Duration::ZERO,
        }
    }

    /// Stop whatever ran before and arm the entered state's timer.
    fn start_state_timer(&mut self) {
        self.timers.stop_all();
        if let Some(id) = self.state.behavior().timer {
            self.arm_timer(id);
        }
    }

    fn arm_timer(&mut self, id: TimerId) {
        let duration = self.timer_duration(id);
        if let Err(e) = self
            .timers
            .add_timer(id, duration, self.timer_tx.clone(), false)
        {
            warn!(peer = %self.identifier, %e, "Failed to arm timer");
        }
    }

    async fn send(&mut self, msg: &DoipMessage) {
        debug!(peer = %self.identifier, "TX {msg}");
        if let Err(e) = self.transport.send(msg).await {
            warn!(peer = %self.identifier, %e, "Send failed");
        }
    }

    /// Emit a diagnostic positive or negative ack (`None` = positive) and
    /// notify the model afterwards.
    async fn send_diagnostic_ack(&mut self, ack: Option<DiagnosticNackCode>) {
        let server = self.model.server_address();
        let client = self.client_address.unwrap_or(0);
        let msg = match ack {
            Some(code) => DoipMessage::diagnostic_negative_ack(server, client, code),
            None => DoipMessage::diagnostic_positive_ack(server, client),
        };
        self.send(&msg).await;
        let info = self.info();
        self.model.on_diagnostic_notification(&info, ack);
    }
}

#[cfg(test)]
mod tests;
