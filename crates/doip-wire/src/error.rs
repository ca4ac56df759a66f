//! Codec errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Header truncated: got {0} of 8 bytes")]
    HeaderTruncated(usize),

    #[error("Inverse protocol version mismatch: version 0x{version:02X}, inverse 0x{inverse:02X}")]
    InverseMismatch { version: u8, inverse: u8 },

    #[error("Payload length {length} invalid for payload type {payload_type:?}")]
    InvalidPayloadLength {
        payload_type: crate::PayloadType,
        length: u32,
    },

    #[error("Payload length {declared} declared, {actual} bytes present")]
    PayloadTruncated { declared: u32, actual: usize },

    #[error("Payload length {0} exceeds the configured maximum of {1}")]
    PayloadTooLarge(u32, u32),

    #[error("Invalid VIN: {0}")]
    InvalidVin(String),
}
