// Protocol constants for Goodix TLS sensors

use std::time::Duration;

/// Goodix vendor ID.
pub const VID: u16 = 0x27C6;

/// Product ID of the TLS-capable 5110 sensor.
pub const PID_5110: u16 = 0x5110;

/// USB interface carrying the command endpoints.
pub const INTERFACE: u8 = 0;

/// Command endpoint, host to device.
pub const ENDPOINT_OUT: u8 = 0x01;

/// Command endpoint, device to host.
pub const ENDPOINT_IN: u8 = 0x81;

/// Largest single OUT transfer accepted by the sensor.
pub const EP_OUT_MAX_BUF_SIZE: usize = 0x40;

/// Largest single IN transfer the sensor produces.
pub const EP_IN_MAX_BUF_SIZE: usize = 0x2000;

/// wMaxPacketSize of the bulk IN endpoints. IN requests are rounded up to it.
pub const EP_IN_MAX_PACKET_SIZE: usize = 0x40;

/// Default per-transfer timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

// --- Frame layer ---

/// Flags + little-endian u16 length.
pub const FRAME_HEADER_LEN: usize = 3;

/// Trailing checksum byte.
pub const FRAME_TRAILER_LEN: usize = 1;

pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + FRAME_TRAILER_LEN;

/// Largest payload per frame so that one frame fits one OUT transfer.
pub const MAX_FRAME_PAYLOAD: usize = EP_OUT_MAX_BUF_SIZE - FRAME_OVERHEAD;

/// Seed added to the byte sum of a frame.
pub const FRAME_CHECKSUM_SEED: u8 = 0x88;

/// Set on every frame of a fragmented packet except the last one.
pub const FLAG_CONTINUATION: u8 = 0x01;

/// Low nibble of the flags byte is reserved for framing bits.
pub const FLAG_FRAMING_MASK: u8 = 0x0F;

/// Frame carries a protocol message.
pub const FLAGS_MSG_PROTOCOL: u8 = 0xA0;

/// Frame carries TLS records.
pub const FLAGS_TLS: u8 = 0xB0;

// --- Protocol layer ---

pub const OPCODE_LEN: usize = 1;

/// Secondary checksum: `PROTOCOL_CHECKSUM_BASE - sum(opcode, payload)`.
pub const PROTOCOL_CHECKSUM_BASE: u8 = 0xAA;

/// `[0xB0][acked opcode][status]`.
pub const ACK_PAYLOAD_LEN: usize = 2;

/// A complete ACK frame on the wire: header, opcode, ack payload, protocol
/// checksum and frame checksum.
pub const ACK_FRAME_LEN: usize = FRAME_OVERHEAD + OPCODE_LEN + ACK_PAYLOAD_LEN + 1;

// --- Device constants ---

/// Only firmware known to support the encrypted channel.
pub const FIRMWARE_VERSION_SUPPORTED: &str = "GF_ST411SEC_APP_12109";

/// Space reserved for the NUL-padded firmware version string.
pub const FIRMWARE_VERSION_FIELD_LEN: usize = 32;

/// The version string starts this many bytes into the firmware reply data,
/// after the opcode.
pub const FIRMWARE_VERSION_OFFSET: usize = 3;

/// Argument of the MCU state query.
pub const QUERY_MCU_STATE_ARG: u8 = 0x55;

/// PSK read replies echo `[address:4][length:4]` before the data.
pub const PSK_REPLY_HEADER_LEN: usize = 8;

pub const PSK_LEN: usize = 32;

/// Device-side address the PSK is written to.
pub const PSK_WRITE_ADDRESS: u32 = 0xBB01_0002;

/// Device-side address reporting the digest of the stored PSK.
pub const PSK_HASH_ADDRESS: u32 = 0xBB02_0003;

/// Digest a factory-fresh sensor reports in its TLS hello.
pub const ZERO_PSK_HASH: [u8; 32] = [
    0xba, 0x1a, 0x86, 0x03, 0x7c, 0x1d, 0x3c, 0x71, 0xc3, 0xaf, 0x34, 0x49, 0x55, 0xbd, 0x69, 0xa9, 0xa9, 0x86,
    0x1d, 0x9e, 0x91, 0x1f, 0xa2, 0x49, 0x85, 0xb6, 0x77, 0xe8, 0xdb, 0xd7, 0x2d, 0x43,
];

/// MCU configuration blob uploaded to 5110 sensors.
#[rustfmt::skip]
pub const DEVICE_CONFIG: &[u8] = &[
    0x70, 0x11, 0x60, 0x71, 0x2c, 0x9d, 0x2c, 0xc9, 0x1c, 0xe5, 0x18, 0xfd,
    0x00, 0xfd, 0x00, 0xfd, 0x03, 0xba, 0x00, 0x01, 0x80, 0xca, 0x00, 0x04,
    0x00, 0x84, 0x00, 0x15, 0xb3, 0x86, 0x00, 0x00, 0xc4, 0x88, 0x00, 0x00,
    0xba, 0x8a, 0x00, 0x00, 0xb2, 0x8c, 0x00, 0x00, 0xaa, 0x8e, 0x00, 0x00,
    0xc1, 0x90, 0x00, 0xbb, 0xbb, 0x92, 0x00, 0xb1, 0xb1, 0x94, 0x00, 0x00,
    0xa8, 0x96, 0x00, 0x00, 0xb6, 0x98, 0x00, 0x00, 0x00, 0x9a, 0x00, 0x00,
    0x00, 0xd2, 0x00, 0x00, 0x00, 0xd4, 0x00, 0x00, 0x00, 0xd6, 0x00, 0x00,
    0x00, 0xd8, 0x00, 0x00, 0x00, 0x50, 0x00, 0x01, 0x05, 0xd0, 0x00, 0x00,
    0x00, 0x70, 0x00, 0x00, 0x00, 0x72, 0x00, 0x78, 0x56, 0x74, 0x00, 0x34,
    0x12, 0x20, 0x00, 0x10, 0x40, 0x2a, 0x01, 0x02, 0x04, 0x22, 0x00, 0x01,
    0x20, 0x24, 0x00, 0x32, 0x00, 0x80, 0x00, 0x01, 0x00, 0x5c, 0x00, 0x80,
    0x00, 0x56, 0x00, 0x04, 0x20, 0x58, 0x00, 0x03, 0x02, 0x32, 0x00, 0x0c,
    0x02, 0x66, 0x00, 0x03, 0x00, 0x7c, 0x00, 0x00, 0x58, 0x82, 0x00, 0x80,
    0x15, 0x2a, 0x01, 0x82, 0x03, 0x22, 0x00, 0x01, 0x20, 0x24, 0x00, 0x14,
    0x00, 0x80, 0x00, 0x01, 0x00, 0x5c, 0x00, 0x00, 0x01, 0x56, 0x00, 0x04,
    0x20, 0x58, 0x00, 0x03, 0x02, 0x32, 0x00, 0x0c, 0x02, 0x66, 0x00, 0x03,
    0x00, 0x7c, 0x00, 0x00, 0x58, 0x82, 0x00, 0x80, 0x1f, 0x2a, 0x01, 0x08,
    0x00, 0x5c, 0x00, 0x80, 0x00, 0x54, 0x00, 0x10, 0x01, 0x62, 0x00, 0x04,
    0x03, 0x64, 0x00, 0x19, 0x00, 0x66, 0x00, 0x03, 0x00, 0x7c, 0x00, 0x01,
    0x58, 0x2a, 0x01, 0x08, 0x00, 0x5c, 0x00, 0x00, 0x01, 0x52, 0x00, 0x08,
    0x00, 0x54, 0x00, 0x00, 0x01, 0x66, 0x00, 0x03, 0x00, 0x7c, 0x00, 0x01,
    0x58, 0x00, 0x89, 0x2e,
];
