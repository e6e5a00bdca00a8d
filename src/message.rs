//! Protocol messages carried inside frame payloads.
//!
//! Layout: `[opcode:1][payload...][checksum:1 if required]` where the checksum
//! is `0xAA - sum(opcode, payload)`. Replies are either an ACK (opcode
//! `0xB0`, payload `[acked opcode, status]`) or a data response echoing the
//! request opcode.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::constants::{ACK_PAYLOAD_LEN, OPCODE_LEN, PROTOCOL_CHECKSUM_BASE};
use crate::error::{ChecksumLayer, Error, Result};
use crate::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    McuGetImage = 0x20,
    McuSwitchToFdtMode = 0x36,
    McuSwitchToIdleMode = 0x70,
    WriteSensorRegister = 0x80,
    ReadSensorRegister = 0x82,
    UploadConfigMcu = 0x90,
    SetPowerdownScanFrequency = 0x94,
    EnableChip = 0x96,
    Reset = 0xA2,
    FirmwareVersion = 0xA8,
    QueryMcuState = 0xAE,
    Ack = 0xB0,
    TlsRecord = 0xB2,
    RequestTlsConnection = 0xD0,
    TlsSuccessfullyEstablished = 0xD4,
    PresetPskWriteR = 0xE0,
    PresetPskReadR = 0xE4,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// `0xAA` minus the byte sum of opcode and payload.
pub fn protocol_checksum(opcode: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(PROTOCOL_CHECKSUM_BASE.wrapping_sub(opcode), |acc, b| acc.wrapping_sub(*b))
}

/// An outbound command message plus the response-length hints the reader
/// uses to size its transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub opcode: Opcode,
    pub checksum_required: bool,
    pub payload: Bytes,
    /// Length of the first reply transfer (usually the ACK frame).
    pub response_len: Option<usize>,
    /// Length of the second reply transfer of a two-phase response.
    pub response_len_secondary: Option<usize>,
}

impl ProtocolMessage {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            checksum_required: true,
            payload: payload.into(),
            response_len: None,
            response_len_secondary: None,
        }
    }

    pub fn without_checksum(mut self) -> Self {
        self.checksum_required = false;
        self
    }

    pub fn with_response_len(mut self, primary: usize, secondary: Option<usize>) -> Self {
        self.response_len = Some(primary);
        self.response_len_secondary = secondary;
        self
    }

    pub fn encode(&self) -> Bytes {
        let opcode: u8 = self.opcode.into();
        let mut buf = BytesMut::with_capacity(OPCODE_LEN + self.payload.len() + 1);
        buf.put_u8(opcode);
        buf.put_slice(&self.payload);
        if self.checksum_required {
            buf.put_u8(protocol_checksum(opcode, &self.payload));
        }
        buf.freeze()
    }

    pub fn to_packet(&self, flags: u8) -> Packet {
        Packet::new(flags, self.encode())
    }

    /// Length of the encoded message.
    pub fn encoded_len(&self) -> usize {
        OPCODE_LEN + self.payload.len() + usize::from(self.checksum_required)
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The device accepted `opcode`; any data follows in a separate transfer.
    Ack { opcode: Opcode, status: u8 },
    /// Reply data for `opcode`, checksum stripped.
    Data { opcode: Opcode, payload: Bytes },
}

impl Response {
    /// Decode a reply message. `checksum_required` applies to data replies;
    /// ACKs always carry a checksum.
    pub fn decode(message: Bytes, checksum_required: bool) -> Result<Response> {
        let Some(&opcode_byte) = message.first() else {
            return Err(Error::MalformedResponse("empty protocol message".to_string()));
        };
        let opcode = Opcode::from_primitive(opcode_byte);

        if opcode == Opcode::Ack {
            let payload = strip_checksum(&message)?;
            if payload.len() != ACK_PAYLOAD_LEN {
                return Err(Error::MalformedResponse(format!(
                    "ACK payload must be {ACK_PAYLOAD_LEN} bytes, got {}",
                    payload.len()
                )));
            }
            return Ok(Response::Ack {
                opcode: Opcode::from_primitive(payload[0]),
                status: payload[1],
            });
        }

        let payload = if checksum_required {
            strip_checksum(&message)?
        } else {
            message.slice(OPCODE_LEN..)
        };
        Ok(Response::Data { opcode, payload })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Ack { opcode, .. } | Response::Data { opcode, .. } => *opcode,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Response::Ack { .. })
    }

    /// The ACK for `expected`, or an error describing what arrived instead.
    pub fn expect_ack(self, expected: Opcode) -> Result<u8> {
        match self {
            Response::Ack { opcode, status } if opcode == expected => Ok(status),
            Response::Ack { opcode, .. } => Err(Error::MalformedResponse(format!(
                "ACK for {opcode:?} while waiting for {expected:?}"
            ))),
            Response::Data { opcode, .. } => Err(Error::MalformedResponse(format!(
                "{opcode:?} data while waiting for ACK of {expected:?}"
            ))),
        }
    }

    /// The data payload for `expected`.
    pub fn expect_data(self, expected: Opcode) -> Result<Bytes> {
        match self {
            Response::Data { opcode, payload } if opcode == expected => Ok(payload),
            other => Err(Error::MalformedResponse(format!(
                "{:?} {} while waiting for {expected:?} data",
                other.opcode(),
                if other.is_ack() { "ACK" } else { "data" },
            ))),
        }
    }
}

/// Payload between opcode and trailing checksum, after verifying it.
fn strip_checksum(message: &Bytes) -> Result<Bytes> {
    if message.len() < OPCODE_LEN + 1 {
        return Err(Error::MalformedResponse(format!(
            "protocol message too short for checksum: {} bytes",
            message.len()
        )));
    }
    let end = message.len() - 1;
    let payload = message.slice(OPCODE_LEN..end);
    let expected = protocol_checksum(message[0], &payload);
    let actual = message[end];
    if expected != actual {
        return Err(Error::Checksum {
            layer: ChecksumLayer::Protocol,
            expected,
            actual,
        });
    }
    Ok(payload)
}

/// Encode an ACK message, as the sensor would send it.
pub fn encode_ack(opcode: Opcode, status: u8) -> Bytes {
    ProtocolMessage::new(Opcode::Ack, vec![opcode.into(), status]).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_firmware_version_request_bytes() {
        let message = ProtocolMessage::new(Opcode::FirmwareVersion, vec![0x00, 0x00]);
        assert_eq!(hex::encode(message.encode()), "a8000002");
        assert_eq!(message.encoded_len(), 4);
    }

    #[test]
    fn test_message_without_checksum() {
        let message = ProtocolMessage::new(Opcode::Nop, vec![0x00; 4]).without_checksum();
        assert_eq!(hex::encode(message.encode()), "0000000000");
    }

    #[test]
    fn test_decode_ack() {
        let bytes = Bytes::from(hex::decode("b0a80151").unwrap());
        let response = Response::decode(bytes, false).unwrap();
        assert_eq!(
            response,
            Response::Ack {
                opcode: Opcode::FirmwareVersion,
                status: 0x01
            }
        );
        assert_eq!(response.expect_ack(Opcode::FirmwareVersion).unwrap(), 0x01);
    }

    #[test]
    fn test_ack_checksum_always_checked() {
        let bytes = Bytes::from(hex::decode("b0a80152").unwrap());
        let err = Response::decode(bytes, false).unwrap_err();
        assert!(matches!(
            err,
            Error::Checksum {
                layer: ChecksumLayer::Protocol,
                expected: 0x51,
                actual: 0x52
            }
        ));
    }

    #[test]
    fn test_decode_data_with_checksum() {
        let encoded = ProtocolMessage::new(Opcode::QueryMcuState, vec![0x01, 0x02, 0x03]).encode();
        let response = Response::decode(encoded, true).unwrap();
        assert_eq!(
            response.expect_data(Opcode::QueryMcuState).unwrap().as_ref(),
            &[0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn test_decode_data_without_checksum_keeps_all_bytes() {
        let encoded = Bytes::from_static(&[0xB2, 0x16, 0x03, 0x03]);
        let response = Response::decode(encoded, false).unwrap();
        assert_eq!(
            response,
            Response::Data {
                opcode: Opcode::TlsRecord,
                payload: Bytes::from_static(&[0x16, 0x03, 0x03])
            }
        );
    }

    #[test]
    fn test_corrupted_data_payload_detected() {
        let mut encoded = ProtocolMessage::new(Opcode::ReadSensorRegister, vec![0x10, 0x20])
            .encode()
            .to_vec();
        encoded[1] ^= 0x01;
        let err = Response::decode(Bytes::from(encoded), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumError);
    }

    #[test]
    fn test_ack_for_wrong_opcode() {
        let response = Response::decode(encode_ack(Opcode::EnableChip, 0), false).unwrap();
        let err = response.expect_ack(Opcode::Reset).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_empty_and_short_messages() {
        assert_eq!(
            Response::decode(Bytes::new(), false).unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            Response::decode(Bytes::from_static(&[0xA8]), true).unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
    }

    #[test]
    fn test_unknown_opcode_is_preserved() {
        let opcode = Opcode::from_primitive(0x5A);
        assert_eq!(opcode, Opcode::Unknown(0x5A));
        let raw: u8 = opcode.into();
        assert_eq!(raw, 0x5A);
    }
}
