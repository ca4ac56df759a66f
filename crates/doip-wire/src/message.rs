//! Framed DoIP message: generic header parsing, serialization, payload
//! builders and typed field accessors.

use std::fmt;

use crate::payload::{
    ActivationType, DiagnosticNackCode, FurtherAction, HeaderNackCode, PayloadType,
    RoutingResponseCode,
};
use crate::{Eid, Gid, LogicalAddress, Vin, WireError, HEADER_LENGTH, PROTOCOL_VERSION};

/// A framed DoIP message.
///
/// Immutable once constructed; created either by parsing received bytes or
/// by one of the payload builders. The inverse protocol version byte is
/// derived on serialization, so a message that parsed successfully always
/// re-serializes to the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoipMessage {
    protocol_version: u8,
    payload_type: PayloadType,
    payload: Vec<u8>,
}

impl DoipMessage {
    /// Construct a message from parts. Used by builders and by transports
    /// that have already split header and payload.
    pub fn new(payload_type: PayloadType, payload: Vec<u8>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            payload_type,
            payload,
        }
    }

    /// Parse the 8-byte generic header.
    ///
    /// Returns the payload type and declared payload length. Fails if fewer
    /// than 8 bytes are present, if the inverse byte is not the bitwise
    /// complement of the version byte, or if a *known* payload type declares
    /// a length that type cannot have. Unknown payload types pass length
    /// validation; rejecting them is connection policy.
    pub fn parse_header(bytes: &[u8]) -> Result<(PayloadType, u32), WireError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(WireError::HeaderTruncated(bytes.len()));
        }
        let version = bytes[0];
        let inverse = bytes[1];
        if inverse != !version {
            return Err(WireError::InverseMismatch { version, inverse });
        }
        let payload_type = PayloadType::from_wire(u16::from_be_bytes([bytes[2], bytes[3]]));
        let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if !payload_type.accepts_payload_length(length) {
            return Err(WireError::InvalidPayloadLength {
                payload_type,
                length,
            });
        }
        Ok((payload_type, length))
    }

    /// Parse a complete frame: header plus exactly the declared payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let (payload_type, length) = Self::parse_header(bytes)?;
        let actual = bytes.len() - HEADER_LENGTH;
        if actual != length as usize {
            return Err(WireError::PayloadTruncated {
                declared: length,
                actual,
            });
        }
        Ok(Self {
            protocol_version: bytes[0],
            payload_type,
            payload: bytes[HEADER_LENGTH..].to_vec(),
        })
    }

    /// Serialize header and payload to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        bytes.push(self.protocol_version);
        bytes.push(!self.protocol_version);
        bytes.extend_from_slice(&self.payload_type.to_wire().to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total frame size on the wire.
    pub fn size(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }

    // === builders ===
    //
    // Each builder writes its fields in ISO 13400-2 order: source address
    // (2 BE), target address (2 BE), response/ack code (1), then payload.

    pub fn generic_nack(code: HeaderNackCode) -> Self {
        Self::new(PayloadType::GenericNegativeAck, vec![code as u8])
    }

    pub fn vehicle_identification_request() -> Self {
        Self::new(PayloadType::VehicleIdentificationRequest, Vec::new())
    }

    /// Vehicle identification response / announcement (33-byte payload,
    /// sync status included as 0x00).
    pub fn vehicle_identification_response(
        vin: &Vin,
        logical_address: LogicalAddress,
        eid: &Eid,
        gid: &Gid,
        further_action: FurtherAction,
    ) -> Self {
        let mut payload = Vec::with_capacity(33);
        payload.extend_from_slice(vin.as_bytes());
        payload.extend_from_slice(&logical_address.to_be_bytes());
        payload.extend_from_slice(eid);
        payload.extend_from_slice(gid);
        payload.push(further_action as u8);
        payload.push(0x00); // VIN/GID sync status: synchronized
        Self::new(PayloadType::VehicleIdentificationResponse, payload)
    }

    pub fn routing_activation_request(source_address: LogicalAddress) -> Self {
        let mut payload = Vec::with_capacity(11);
        payload.extend_from_slice(&source_address.to_be_bytes());
        payload.push(ActivationType::Default as u8);
        payload.extend_from_slice(&[0x00; 4]);
        payload.extend_from_slice(&[0x00; 4]); // OEM-specific
        Self::new(PayloadType::RoutingActivationRequest, payload)
    }

    pub fn routing_activation_response(
        client_address: LogicalAddress,
        server_address: LogicalAddress,
        code: RoutingResponseCode,
    ) -> Self {
        let mut payload = Vec::with_capacity(9);
        payload.extend_from_slice(&client_address.to_be_bytes());
        payload.extend_from_slice(&server_address.to_be_bytes());
        payload.push(code as u8);
        payload.extend_from_slice(&[0x00; 4]);
        Self::new(PayloadType::RoutingActivationResponse, payload)
    }

    pub fn alive_check_request() -> Self {
        Self::new(PayloadType::AliveCheckRequest, Vec::new())
    }

    pub fn alive_check_response(source_address: LogicalAddress) -> Self {
        Self::new(
            PayloadType::AliveCheckResponse,
            source_address.to_be_bytes().to_vec(),
        )
    }

    pub fn diagnostic_message(
        source_address: LogicalAddress,
        target_address: LogicalAddress,
        user_data: &[u8],
    ) -> Self {
        let mut payload = Vec::with_capacity(4 + user_data.len());
        payload.extend_from_slice(&source_address.to_be_bytes());
        payload.extend_from_slice(&target_address.to_be_bytes());
        payload.extend_from_slice(user_data);
        Self::new(PayloadType::DiagnosticMessage, payload)
    }

    pub fn diagnostic_positive_ack(
        source_address: LogicalAddress,
        target_address: LogicalAddress,
    ) -> Self {
        let mut payload = Vec::with_capacity(5);
        payload.extend_from_slice(&source_address.to_be_bytes());
        payload.extend_from_slice(&target_address.to_be_bytes());
        payload.push(0x00); // routing confirmation ack
        Self::new(PayloadType::DiagnosticPositiveAck, payload)
    }

    pub fn diagnostic_negative_ack(
        source_address: LogicalAddress,
        target_address: LogicalAddress,
        code: DiagnosticNackCode,
    ) -> Self {
        let mut payload = Vec::with_capacity(5);
        payload.extend_from_slice(&source_address.to_be_bytes());
        payload.extend_from_slice(&target_address.to_be_bytes());
        payload.push(code as u8);
        Self::new(PayloadType::DiagnosticNegativeAck, payload)
    }

    // === typed accessors ===
    //
    // Each accessor yields `None` when the payload type does not carry the
    // field (or the payload is too short, which header validation normally
    // rules out for messages that came through `parse`).

    fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes = self.payload.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Source address field of routing activation requests, alive check
    /// responses, diagnostic messages and diagnostic acks.
    pub fn source_address(&self) -> Option<LogicalAddress> {
        match self.payload_type {
            PayloadType::RoutingActivationRequest
            | PayloadType::AliveCheckResponse
            | PayloadType::DiagnosticMessage
            | PayloadType::DiagnosticPositiveAck
            | PayloadType::DiagnosticNegativeAck => self.u16_at(0),
            _ => None,
        }
    }

    /// Target address field of diagnostic messages and diagnostic acks.
    pub fn target_address(&self) -> Option<LogicalAddress> {
        match self.payload_type {
            PayloadType::DiagnosticMessage
            | PayloadType::DiagnosticPositiveAck
            | PayloadType::DiagnosticNegativeAck => self.u16_at(2),
            _ => None,
        }
    }

    pub fn vin(&self) -> Option<Vin> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse
            | PayloadType::VehicleIdentificationRequestWithVin => {
                let bytes: [u8; 17] = self.payload.get(..17)?.try_into().ok()?;
                Some(Vin::from_bytes(bytes))
            }
            _ => None,
        }
    }

    /// Announced logical address of the vehicle identification response.
    pub fn logical_address(&self) -> Option<LogicalAddress> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse => self.u16_at(17),
            _ => None,
        }
    }

    pub fn eid(&self) -> Option<Eid> {
        let range = match self.payload_type {
            PayloadType::VehicleIdentificationResponse => 19..25,
            PayloadType::VehicleIdentificationRequestWithEid => 0..6,
            _ => return None,
        };
        self.payload.get(range)?.try_into().ok()
    }

    pub fn gid(&self) -> Option<Gid> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse => self.payload.get(25..31)?.try_into().ok(),
            _ => None,
        }
    }

    pub fn further_action(&self) -> Option<u8> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse => self.payload.get(31).copied(),
            _ => None,
        }
    }

    /// UDS bytes carried by a diagnostic message.
    pub fn user_data(&self) -> Option<&[u8]> {
        match self.payload_type {
            PayloadType::DiagnosticMessage => self.payload.get(4..),
            _ => None,
        }
    }

    pub fn routing_response_code(&self) -> Option<RoutingResponseCode> {
        match self.payload_type {
            PayloadType::RoutingActivationResponse => {
                RoutingResponseCode::from_wire(*self.payload.get(4)?)
            }
            _ => None,
        }
    }

    pub fn diagnostic_nack_code(&self) -> Option<DiagnosticNackCode> {
        match self.payload_type {
            PayloadType::DiagnosticNegativeAck => {
                DiagnosticNackCode::from_wire(*self.payload.get(4)?)
            }
            _ => None,
        }
    }
}

impl fmt::Display for DoipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} payload {} bytes",
            self.payload_type,
            self.payload.len()
        )
    }
}
