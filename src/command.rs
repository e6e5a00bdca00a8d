//! Request/response descriptors for every device command.
//!
//! A [`Command`] is built once and never mutated by the code that runs it.
//! It carries the encoded request, the frame flags it is sent with and the
//! [`ResponseShape`] telling the reader how many replies to collect.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::constants::{
    ACK_FRAME_LEN, DEFAULT_COMMAND_TIMEOUT, EP_IN_MAX_BUF_SIZE, FIRMWARE_VERSION_OFFSET, FLAGS_MSG_PROTOCOL,
    FLAGS_TLS, FRAME_OVERHEAD, OPCODE_LEN, PSK_REPLY_HEADER_LEN, QUERY_MCU_STATE_ARG,
};
use crate::error::{Error, Result};
use crate::message::{Opcode, ProtocolMessage, Response};
use crate::packet::Packet;
use crate::transport::{CommandChannel, Transport};

/// What the device sends back after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Nothing; the command completes once written.
    None,
    /// A single ACK frame.
    Ack,
    /// An ACK frame, then the data in a second protocol packet.
    AckThenData {
        /// Exact reply data length after the opcode, when fixed.
        data_len: Option<usize>,
        /// Where the useful bytes start within the reply data.
        data_offset: usize,
    },
    /// An ACK frame, then a TLS-flagged packet carrying record bytes.
    TlsRecord { max_len: usize },
}

impl ResponseShape {
    pub fn expects_ack(&self) -> bool {
        !matches!(self, ResponseShape::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub message: ProtocolMessage,
    pub flags: u8,
    pub response: ResponseShape,
    /// Whether a data reply ends with a protocol checksum.
    pub response_checksum: bool,
    pub timeout: Option<Duration>,
    /// Time the device needs after acknowledging before it accepts more.
    pub settle: Option<Duration>,
    /// IN endpoint of the second reply phase when it is not the command one.
    pub data_endpoint: Option<u8>,
}

impl Command {
    fn new(name: &'static str, message: ProtocolMessage, response: ResponseShape) -> Self {
        let secondary = match response {
            ResponseShape::AckThenData { data_len, .. } => {
                Some(data_len.map_or(EP_IN_MAX_BUF_SIZE, |len| FRAME_OVERHEAD + OPCODE_LEN + len + 1))
            }
            ResponseShape::TlsRecord { max_len } => Some(max_len),
            ResponseShape::None | ResponseShape::Ack => None,
        };
        let message = if response.expects_ack() {
            message.with_response_len(ACK_FRAME_LEN, secondary)
        } else {
            message
        };
        Self {
            name,
            message,
            flags: FLAGS_MSG_PROTOCOL,
            response,
            response_checksum: !matches!(response, ResponseShape::TlsRecord { .. }),
            timeout: None,
            settle: None,
            data_endpoint: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_data_endpoint(mut self, endpoint: u8) -> Self {
        self.data_endpoint = Some(endpoint);
        self
    }

    fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = Some(settle);
        self
    }

    fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.message.opcode
    }

    /// Per-transfer timeout, falling back to `default` when the command does
    /// not set one.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout_or(DEFAULT_COMMAND_TIMEOUT)
    }

    /// Send the command and collect the replies its [`ResponseShape`]
    /// declares. Writes and reads strictly alternate.
    pub async fn execute<T: Transport>(&self, channel: &mut CommandChannel<T>, default_timeout: Duration) -> Result<Reply> {
        let timeout = self.timeout_or(default_timeout);
        debug!(command = self.name, opcode = ?self.opcode(), "Running command");
        channel.send_packet(&self.message.to_packet(self.flags), timeout).await?;

        if !self.response.expects_ack() {
            return Ok(Reply::Written);
        }

        let ack = channel
            .read_packet(self.message.response_len.unwrap_or(ACK_FRAME_LEN), timeout)
            .await?;
        expect_flags(&ack, FLAGS_MSG_PROTOCOL)?;
        if let Some(expected) = self.message.response_len {
            let actual = channel.last_packet_wire_len();
            if actual != expected {
                return Err(Error::UnexpectedResponseLength { expected, actual });
            }
        }
        let status = Response::decode(ack.payload, true)?.expect_ack(self.opcode())?;
        debug!(command = self.name, status, "Command acknowledged");

        let reply = match self.response {
            ResponseShape::None | ResponseShape::Ack => Reply::Acked(status),
            ResponseShape::AckThenData { data_len, data_offset } => {
                let packet = match self.data_endpoint {
                    Some(endpoint) => channel.read_packet_from(endpoint, self.secondary_len(), timeout).await?,
                    None => channel.read_packet(self.secondary_len(), timeout).await?,
                };
                expect_flags(&packet, FLAGS_MSG_PROTOCOL)?;
                let data = Response::decode(packet.payload, self.response_checksum)?.expect_data(self.opcode())?;
                if let Some(expected) = data_len {
                    if data.len() != expected {
                        return Err(Error::UnexpectedResponseLength {
                            expected,
                            actual: data.len(),
                        });
                    }
                }
                if data.len() < data_offset {
                    return Err(Error::UnexpectedResponseLength {
                        expected: data_offset,
                        actual: data.len(),
                    });
                }
                Reply::Data(data.slice(data_offset..))
            }
            ResponseShape::TlsRecord { max_len } => {
                let packet = channel.read_packet(self.secondary_len(), timeout).await?;
                let record = decode_record(packet)?;
                if record.len() > max_len {
                    return Err(Error::UnexpectedResponseLength {
                        expected: max_len,
                        actual: record.len(),
                    });
                }
                Reply::Record(record)
            }
        };

        if let Some(settle) = self.settle {
            tokio::time::sleep(settle).await;
        }
        Ok(reply)
    }

    fn secondary_len(&self) -> usize {
        self.message.response_len_secondary.unwrap_or(EP_IN_MAX_BUF_SIZE)
    }
}

/// Outcome of [`Command::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sent; the command has no reply.
    Written,
    /// ACK status byte.
    Acked(u8),
    /// Reply data from the declared offset on.
    Data(Bytes),
    /// Raw TLS record bytes.
    Record(Bytes),
}

impl Reply {
    pub fn into_data(self) -> Result<Bytes> {
        match self {
            Reply::Data(data) | Reply::Record(data) => Ok(data),
            other => Err(Error::MalformedResponse(format!("expected reply data, got {other:?}"))),
        }
    }
}

fn expect_flags(packet: &Packet, flags: u8) -> Result<()> {
    if packet.flags != flags {
        return Err(Error::MalformedResponse(format!(
            "packet flags {:#04x}, expected {flags:#04x}",
            packet.flags
        )));
    }
    Ok(())
}

/// Record bytes of a TLS-flagged packet.
pub fn decode_record(packet: Packet) -> Result<Bytes> {
    expect_flags(&packet, FLAGS_TLS)?;
    Response::decode(packet.payload, false)?.expect_data(Opcode::TlsRecord)
}

pub fn nop() -> Command {
    let message = ProtocolMessage::new(Opcode::Nop, vec![0x00; 4]).without_checksum();
    Command::new("nop", message, ResponseShape::None)
}

pub fn enable_chip(enable: bool) -> Command {
    let message = ProtocolMessage::new(Opcode::EnableChip, vec![u8::from(enable), 0x00]);
    Command::new("enable_chip", message, ResponseShape::Ack)
}

/// Reset the sensor and/or soft-reset the MCU. `sleep_time_ms` is both sent
/// to the device and waited out after the ACK.
pub fn reset(reset_sensor: bool, soft_reset_mcu: bool, sleep_time_ms: u8) -> Command {
    let mode = u8::from(reset_sensor) | (u8::from(soft_reset_mcu) << 1);
    let message = ProtocolMessage::new(Opcode::Reset, vec![mode, sleep_time_ms]);
    Command::new("reset", message, ResponseShape::Ack).with_settle(Duration::from_millis(u64::from(sleep_time_ms)))
}

pub fn firmware_version() -> Command {
    let message = ProtocolMessage::new(Opcode::FirmwareVersion, vec![0x00, 0x00]);
    Command::new(
        "firmware_version",
        message,
        ResponseShape::AckThenData {
            data_len: None,
            data_offset: FIRMWARE_VERSION_OFFSET,
        },
    )
}

pub fn query_mcu_state() -> Command {
    let message = ProtocolMessage::new(Opcode::QueryMcuState, vec![QUERY_MCU_STATE_ARG]);
    Command::new(
        "query_mcu_state",
        message,
        ResponseShape::AckThenData {
            data_len: None,
            data_offset: 0,
        },
    )
}

pub fn upload_config_mcu(config: impl Into<Bytes>) -> Command {
    let message = ProtocolMessage::new(Opcode::UploadConfigMcu, config);
    Command::new("upload_config_mcu", message, ResponseShape::Ack)
}

pub fn set_powerdown_scan_frequency(frequency: u16) -> Command {
    let message = ProtocolMessage::new(Opcode::SetPowerdownScanFrequency, frequency.to_le_bytes().to_vec());
    Command::new("set_powerdown_scan_frequency", message, ResponseShape::Ack)
}

pub fn write_sensor_register(address: u16, value: u16) -> Command {
    let mut payload = BytesMut::with_capacity(5);
    payload.put_u8(0x00);
    payload.put_u16_le(address);
    payload.put_u16_le(value);
    let message = ProtocolMessage::new(Opcode::WriteSensorRegister, payload.freeze());
    Command::new("write_sensor_register", message, ResponseShape::Ack)
}

pub fn read_sensor_register(address: u16, length: u8) -> Command {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u8(0x00);
    payload.put_u16_le(address);
    payload.put_u8(length);
    let message = ProtocolMessage::new(Opcode::ReadSensorRegister, payload.freeze());
    Command::new(
        "read_sensor_register",
        message,
        ResponseShape::AckThenData {
            data_len: Some(usize::from(length)),
            data_offset: 0,
        },
    )
}

pub fn switch_to_idle_mode(sleep_time: u8) -> Command {
    let message = ProtocolMessage::new(Opcode::McuSwitchToIdleMode, vec![sleep_time, 0x00]);
    Command::new("switch_to_idle_mode", message, ResponseShape::Ack)
}

/// Arm finger detection with a sensor-specific mode blob.
pub fn switch_to_fdt_mode(mode: impl Into<Bytes>) -> Command {
    let message = ProtocolMessage::new(Opcode::McuSwitchToFdtMode, mode);
    Command::new("switch_to_fdt_mode", message, ResponseShape::Ack)
}

/// Fetch a raw image. With `encrypted` the image arrives as a TLS record
/// that only an established tunnel can open.
pub fn mcu_get_image(encrypted: bool) -> Command {
    let message = ProtocolMessage::new(Opcode::McuGetImage, vec![0x01, 0x00]);
    let response = if encrypted {
        ResponseShape::TlsRecord {
            max_len: EP_IN_MAX_BUF_SIZE,
        }
    } else {
        ResponseShape::AckThenData {
            data_len: None,
            data_offset: 0,
        }
    };
    Command::new("mcu_get_image", message, response)
}

/// Ask the sensor to open a TLS session. It answers with its hello record.
pub fn request_tls_connection() -> Command {
    let message = ProtocolMessage::new(Opcode::RequestTlsConnection, vec![0x00, 0x00]);
    Command::new(
        "request_tls_connection",
        message,
        ResponseShape::TlsRecord {
            max_len: EP_IN_MAX_BUF_SIZE,
        },
    )
}

pub fn tls_successfully_established() -> Command {
    let message = ProtocolMessage::new(Opcode::TlsSuccessfullyEstablished, vec![0x00, 0x00]);
    Command::new("tls_successfully_established", message, ResponseShape::Ack)
}

/// One handshake or application record for the sensor. Replies are pulled
/// separately by the tunnel.
pub fn tls_record(record: impl Into<Bytes>) -> Command {
    let message = ProtocolMessage::new(Opcode::TlsRecord, record).without_checksum();
    Command::new("tls_record", message, ResponseShape::None).with_flags(FLAGS_TLS)
}

pub fn preset_psk_write(address: u32, psk: &[u8]) -> Command {
    let mut payload = BytesMut::with_capacity(PSK_REPLY_HEADER_LEN + psk.len());
    payload.put_u32_le(address);
    payload.put_u32_le(psk.len() as u32);
    payload.put_slice(psk);
    let message = ProtocolMessage::new(Opcode::PresetPskWriteR, payload.freeze());
    Command::new("preset_psk_write", message, ResponseShape::Ack)
}

pub fn preset_psk_read(address: u32, length: u32) -> Command {
    let mut payload = BytesMut::with_capacity(PSK_REPLY_HEADER_LEN);
    payload.put_u32_le(address);
    payload.put_u32_le(length);
    let message = ProtocolMessage::new(Opcode::PresetPskReadR, payload.freeze());
    Command::new(
        "preset_psk_read",
        message,
        ResponseShape::AckThenData {
            data_len: Some(PSK_REPLY_HEADER_LEN + length as usize),
            data_offset: PSK_REPLY_HEADER_LEN,
        },
    )
}
