//! Gateway error taxonomy
//!
//! Protocol faults become wire responses or state transitions inside the
//! connection state machine; the error types here cover what is left:
//! transport failures, timer misuse and setup problems surfaced to the
//! caller.

use thiserror::Error;

use doip_wire::WireError;

use crate::timer::TimerId;

/// Errors raised by the byte transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] WireError),

    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Errors raised by the timer manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer {0} is already armed")]
    AlreadyArmed(TimerId),

    #[error("Timer {0} is not armed")]
    NotArmed(TimerId),
}

/// Top-level gateway errors surfaced to the embedding application.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Downstream provider error: {0}")]
    Downstream(String),
}
