//! DoIP (Diagnostics over IP) wire message codec
//!
//! Implements the ISO 13400-2 generic header and the payload formats the
//! gateway exchanges with testers: vehicle identification, routing
//! activation, alive check and diagnostic messages.
//!
//! The codec is policy-free: it parses and serializes frames and exposes
//! typed field accessors, while the connection state machine decides what
//! to do with a message. Unknown payload types therefore parse successfully
//! and survive a serialize round trip.
//!
//! # Example
//!
//! ```
//! use doip_wire::{DoipMessage, PayloadType};
//!
//! let msg = DoipMessage::routing_activation_request(0x0E80);
//! let bytes = msg.to_bytes();
//! let parsed = DoipMessage::parse(&bytes).unwrap();
//! assert_eq!(parsed.payload_type(), PayloadType::RoutingActivationRequest);
//! assert_eq!(parsed.source_address(), Some(0x0E80));
//! ```

mod error;
mod ident;
mod message;
mod payload;

pub use error::WireError;
pub use ident::{is_valid_source_address, Eid, Gid, Vin};
pub use message::DoipMessage;
pub use payload::{
    ActivationType, DiagnosticNackCode, FurtherAction, HeaderNackCode, PayloadType,
    RoutingResponseCode,
};

/// Logical address of a DoIP entity or tester (16-bit, big-endian on the wire).
pub type LogicalAddress = u16;

/// ISO 13400-2:2012 protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Length of the generic DoIP header.
pub const HEADER_LENGTH: usize = 8;

/// TCP data / UDP discovery port assigned to DoIP.
pub const DOIP_PORT: u16 = 13400;

/// Default upper bound for header-declared payload lengths (64 KiB).
///
/// Frames declaring more are answered with a generic header nack
/// ([`HeaderNackCode::MessageTooLarge`]) instead of being read.
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024;
