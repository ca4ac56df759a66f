//! Payload type and response code enumerations

use std::fmt;

/// DoIP payload type (16-bit wire value, big-endian).
///
/// Unrecognized values are carried in [`PayloadType::Unknown`] so that a
/// parsed frame can be re-serialized byte-identically; whether to answer
/// such a frame is a state machine decision, not a codec one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    GenericNegativeAck,
    VehicleIdentificationRequest,
    VehicleIdentificationRequestWithEid,
    VehicleIdentificationRequestWithVin,
    VehicleIdentificationResponse,
    RoutingActivationRequest,
    RoutingActivationResponse,
    AliveCheckRequest,
    AliveCheckResponse,
    EntityStatusRequest,
    EntityStatusResponse,
    PowerModeRequest,
    PowerModeResponse,
    DiagnosticMessage,
    DiagnosticPositiveAck,
    DiagnosticNegativeAck,
    Unknown(u16),
}

impl PayloadType {
    pub fn from_wire(value: u16) -> Self {
        match value {
            0x0000 => Self::GenericNegativeAck,
            0x0001 => Self::VehicleIdentificationRequest,
            0x0002 => Self::VehicleIdentificationRequestWithEid,
            0x0003 => Self::VehicleIdentificationRequestWithVin,
            0x0004 => Self::VehicleIdentificationResponse,
            0x0005 => Self::RoutingActivationRequest,
            0x0006 => Self::RoutingActivationResponse,
            0x0007 => Self::AliveCheckRequest,
            0x0008 => Self::AliveCheckResponse,
            0x4001 => Self::EntityStatusRequest,
            0x4002 => Self::EntityStatusResponse,
            0x4003 => Self::PowerModeRequest,
            0x4004 => Self::PowerModeResponse,
            0x8001 => Self::DiagnosticMessage,
            0x8002 => Self::DiagnosticPositiveAck,
            0x8003 => Self::DiagnosticNegativeAck,
            other => Self::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Self::GenericNegativeAck => 0x0000,
            Self::VehicleIdentificationRequest => 0x0001,
            Self::VehicleIdentificationRequestWithEid => 0x0002,
            Self::VehicleIdentificationRequestWithVin => 0x0003,
            Self::VehicleIdentificationResponse => 0x0004,
            Self::RoutingActivationRequest => 0x0005,
            Self::RoutingActivationResponse => 0x0006,
            Self::AliveCheckRequest => 0x0007,
            Self::AliveCheckResponse => 0x0008,
            Self::EntityStatusRequest => 0x4001,
            Self::EntityStatusResponse => 0x4002,
            Self::PowerModeRequest => 0x4003,
            Self::PowerModeResponse => 0x4004,
            Self::DiagnosticMessage => 0x8001,
            Self::DiagnosticPositiveAck => 0x8002,
            Self::DiagnosticNegativeAck => 0x8003,
            Self::Unknown(other) => other,
        }
    }

    /// Whether `length` is a legal payload length for this type.
    ///
    /// Fixed-size payloads are checked exactly (with and without the
    /// optional OEM / sync-status trailer where ISO 13400-2 defines one);
    /// diagnostic payloads only have a minimum. Unknown types accept any
    /// length.
    pub fn accepts_payload_length(self, length: u32) -> bool {
        match self {
            Self::GenericNegativeAck => length == 1,
            Self::VehicleIdentificationRequest => length == 0,
            Self::VehicleIdentificationRequestWithEid => length == 6,
            Self::VehicleIdentificationRequestWithVin => length == 17,
            Self::VehicleIdentificationResponse => length == 32 || length == 33,
            Self::RoutingActivationRequest => length == 7 || length == 11,
            Self::RoutingActivationResponse => length == 9 || length == 13,
            Self::AliveCheckRequest => length == 0,
            Self::AliveCheckResponse => length == 2,
            Self::EntityStatusRequest => length == 0,
            Self::EntityStatusResponse => length == 3 || length == 7,
            Self::PowerModeRequest => length == 0,
            Self::PowerModeResponse => length == 1,
            Self::DiagnosticMessage => length >= 4,
            Self::DiagnosticPositiveAck | Self::DiagnosticNegativeAck => length >= 5,
            Self::Unknown(_) => true,
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "Unknown(0x{v:04X})"),
            other => write!(f, "{other:?}(0x{:04X})", other.to_wire()),
        }
    }
}

/// Generic DoIP header negative acknowledge codes (ISO 13400-2 Table 18).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderNackCode {
    IncorrectPatternFormat = 0x00,
    UnknownPayloadType = 0x01,
    MessageTooLarge = 0x02,
    OutOfMemory = 0x03,
    InvalidPayloadLength = 0x04,
}

/// Diagnostic message negative acknowledge codes (ISO 13400-2 Table 26).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiagnosticNackCode {
    InvalidSourceAddress = 0x02,
    UnknownTargetAddress = 0x03,
    DiagnosticMessageTooLarge = 0x04,
    OutOfMemory = 0x05,
    TargetUnreachable = 0x06,
    UnknownNetwork = 0x07,
    TransportProtocolError = 0x08,
}

impl DiagnosticNackCode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::InvalidSourceAddress),
            0x03 => Some(Self::UnknownTargetAddress),
            0x04 => Some(Self::DiagnosticMessageTooLarge),
            0x05 => Some(Self::OutOfMemory),
            0x06 => Some(Self::TargetUnreachable),
            0x07 => Some(Self::UnknownNetwork),
            0x08 => Some(Self::TransportProtocolError),
            _ => None,
        }
    }
}

/// Routing activation response codes (ISO 13400-2 Table 25).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutingResponseCode {
    DeniedUnknownSourceAddress = 0x00,
    DeniedAllSocketsRegistered = 0x01,
    DeniedSourceAddressMismatch = 0x02,
    DeniedSourceAddressInUse = 0x03,
    DeniedMissingAuthentication = 0x04,
    DeniedRejectedConfirmation = 0x05,
    DeniedUnsupportedActivationType = 0x06,
    RouteActivated = 0x10,
    ActivatedConfirmationRequired = 0x11,
}

impl RoutingResponseCode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::DeniedUnknownSourceAddress),
            0x01 => Some(Self::DeniedAllSocketsRegistered),
            0x02 => Some(Self::DeniedSourceAddressMismatch),
            0x03 => Some(Self::DeniedSourceAddressInUse),
            0x04 => Some(Self::DeniedMissingAuthentication),
            0x05 => Some(Self::DeniedRejectedConfirmation),
            0x06 => Some(Self::DeniedUnsupportedActivationType),
            0x10 => Some(Self::RouteActivated),
            0x11 => Some(Self::ActivatedConfirmationRequired),
            _ => None,
        }
    }
}

/// Routing activation type requested by the tester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ActivationType {
    #[default]
    Default = 0x00,
    WwhObd = 0x01,
    CentralSecurity = 0xE0,
}

/// Further-action byte of the vehicle announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FurtherAction {
    #[default]
    NoFurtherAction = 0x00,
    CentralSecurityRequired = 0x10,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for value in [
            0x0000u16, 0x0001, 0x0002, 0x0003, 0x0004, 0x0005, 0x0006, 0x0007, 0x0008, 0x4001,
            0x4002, 0x4003, 0x4004, 0x8001, 0x8002, 0x8003, 0x0099, 0xFFFF,
        ] {
            assert_eq!(PayloadType::from_wire(value).to_wire(), value);
        }
    }

    #[test]
    fn unknown_type_accepts_any_length() {
        let ty = PayloadType::from_wire(0x0099);
        assert_eq!(ty, PayloadType::Unknown(0x0099));
        assert!(ty.accepts_payload_length(0));
        assert!(ty.accepts_payload_length(12345));
    }

    #[test]
    fn fixed_lengths_are_enforced() {
        assert!(PayloadType::AliveCheckResponse.accepts_payload_length(2));
        assert!(!PayloadType::AliveCheckResponse.accepts_payload_length(3));
        assert!(PayloadType::RoutingActivationRequest.accepts_payload_length(7));
        assert!(PayloadType::RoutingActivationRequest.accepts_payload_length(11));
        assert!(!PayloadType::RoutingActivationRequest.accepts_payload_length(8));
        assert!(PayloadType::VehicleIdentificationResponse.accepts_payload_length(33));
        assert!(!PayloadType::DiagnosticMessage.accepts_payload_length(3));
    }
}
