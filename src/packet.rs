//! Wire frames.
//!
//! A frame is `[flags:1][length:2 LE][payload:length][checksum:1]`. The
//! checksum is the byte sum of header and payload plus
//! [`FRAME_CHECKSUM_SEED`]. Payloads larger than one frame are split; every
//! frame but the last carries [`FLAG_CONTINUATION`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{
    FLAG_CONTINUATION, FLAG_FRAMING_MASK, FRAME_CHECKSUM_SEED, FRAME_HEADER_LEN, FRAME_OVERHEAD, MAX_FRAME_PAYLOAD,
};
use crate::error::{ChecksumLayer, Error, Result};

/// A reassembled packet: base flags (framing bits cleared) and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            flags,
            payload: payload.into(),
        }
    }

    /// Split into wire frames of at most `max_frame_payload` payload bytes.
    pub fn encode(&self, max_frame_payload: usize) -> Result<Vec<Bytes>> {
        encode_frames(self.flags, &self.payload, max_frame_payload)
    }

    /// All frames concatenated, using the default frame size.
    pub fn to_wire(&self) -> Result<Bytes> {
        let frames = self.encode(MAX_FRAME_PAYLOAD)?;
        let mut wire = BytesMut::with_capacity(frames.iter().map(Bytes::len).sum());
        for frame in frames {
            wire.extend_from_slice(&frame);
        }
        Ok(wire.freeze())
    }

    /// Decode a buffer that holds exactly one packet.
    ///
    /// Declared frame lengths that do not add up to the buffer are reported
    /// as a frame checksum error: with one packet per buffer, only a
    /// corrupted length field gets there.
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        let mut rest = bytes;
        let mut reassembly = Reassembly::default();
        loop {
            let span = rest;
            let frame_len = match declared_frame_len(span) {
                Some(len) if len <= span.len() => len,
                _ => return Err(misframed(bytes, span)),
            };
            let frame = &span[..frame_len];
            verify_frame_checksum(frame)?;
            rest = &span[frame_len..];
            if let Some(packet) = reassembly.accept(frame)? {
                if !rest.is_empty() {
                    return Err(misframed(bytes, span));
                }
                return Ok(packet);
            }
        }
    }
}

/// Byte sum of `bytes` seeded with [`FRAME_CHECKSUM_SEED`].
pub fn frame_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(FRAME_CHECKSUM_SEED, |acc, b| acc.wrapping_add(*b))
}

pub fn encode_frames(flags: u8, payload: &[u8], max_frame_payload: usize) -> Result<Vec<Bytes>> {
    if flags & FLAG_FRAMING_MASK != 0 {
        return Err(Error::ProtocolState(format!(
            "flags {flags:#04x} overlap the framing bits {FLAG_FRAMING_MASK:#04x}"
        )));
    }
    if max_frame_payload == 0 || max_frame_payload > u16::MAX as usize {
        return Err(Error::ProtocolState(format!(
            "invalid maximum frame payload {max_frame_payload}"
        )));
    }

    if payload.is_empty() {
        return Ok(vec![encode_frame(flags, &[])]);
    }

    let chunks: Vec<&[u8]> = payload.chunks(max_frame_payload).collect();
    let last = chunks.len() - 1;
    Ok(chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let frame_flags = if i < last { flags | FLAG_CONTINUATION } else { flags };
            encode_frame(frame_flags, chunk)
        })
        .collect())
}

fn encode_frame(flags: u8, chunk: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_OVERHEAD + chunk.len());
    frame.put_u8(flags);
    frame.put_u16_le(chunk.len() as u16);
    frame.put_slice(chunk);
    let checksum = frame_checksum(&frame);
    frame.put_u8(checksum);
    frame.freeze()
}

/// Total frame length announced by the header at the start of `buf`.
fn declared_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    Some(FRAME_OVERHEAD + u16::from_le_bytes([buf[1], buf[2]]) as usize)
}

fn verify_frame_checksum(frame: &[u8]) -> Result<()> {
    let (body, trailer) = frame.split_at(frame.len() - 1);
    let expected = frame_checksum(body);
    if expected != trailer[0] {
        return Err(Error::Checksum {
            layer: ChecksumLayer::Frame,
            expected,
            actual: trailer[0],
        });
    }
    Ok(())
}

// Checksum of the frame at the head of `span` taken as if its length field
// were right, that is, spanning the rest of the buffer. An empty span means the
// buffer ended after a continuation frame, so the whole buffer is used.
fn misframed(buffer: &[u8], span: &[u8]) -> Error {
    let frame = if span.is_empty() { buffer } else { span };
    match frame.split_last() {
        Some((&actual, body)) => Error::Checksum {
            layer: ChecksumLayer::Frame,
            expected: frame_checksum(body),
            actual,
        },
        None => Error::MalformedResponse("empty packet".into()),
    }
}

/// Collects frame payloads until a frame without the continuation bit.
#[derive(Debug, Default)]
struct Reassembly {
    flags: Option<u8>,
    payload: BytesMut,
    wire_len: usize,
}

impl Reassembly {
    fn accept(&mut self, frame: &[u8]) -> Result<Option<Packet>> {
        let flags = frame[0];
        let framing = flags & FLAG_FRAMING_MASK;
        if framing & !FLAG_CONTINUATION != 0 {
            self.reset();
            return Err(Error::MalformedResponse(format!(
                "reserved framing bits set in flags {flags:#04x}"
            )));
        }

        let base = flags & !FLAG_FRAMING_MASK;
        match self.flags {
            Some(expected) if expected != base => {
                self.reset();
                return Err(Error::MalformedResponse(format!(
                    "continuation frame flags {base:#04x} do not match {expected:#04x}"
                )));
            }
            Some(_) => {}
            None => self.flags = Some(base),
        }

        self.payload.extend_from_slice(&frame[FRAME_HEADER_LEN..frame.len() - 1]);
        self.wire_len += frame.len();

        if framing & FLAG_CONTINUATION != 0 {
            return Ok(None);
        }

        let packet = Packet {
            flags: base,
            payload: self.payload.split().freeze(),
        };
        self.flags = None;
        Ok(Some(packet))
    }

    fn in_progress(&self) -> bool {
        self.flags.is_some()
    }

    fn reset(&mut self) {
        self.flags = None;
        self.payload.clear();
        self.wire_len = 0;
    }
}

/// Streaming decoder fed with the bytes of successive IN transfers.
///
/// Bytes are buffered until the declared frame length is available, so a
/// frame split over several short reads decodes the same as one delivered
/// whole. Bytes following a completed packet stay buffered for the next call.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
    reassembly: Reassembly,
    last_wire_len: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and try to complete a packet.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<Packet>> {
        self.extend(data);
        self.next_packet()
    }

    /// Append received bytes without decoding them yet.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to complete a packet from already buffered bytes.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let Some(frame_len) = declared_frame_len(&self.buffer) else {
                return Ok(None);
            };
            if self.buffer.len() < frame_len {
                return Ok(None);
            }
            let frame = self.buffer.split_to(frame_len);
            if let Err(err) = verify_frame_checksum(&frame) {
                self.reset();
                return Err(err);
            }
            if let Some(packet) = self.reassembly.accept(&frame)? {
                self.last_wire_len = std::mem::take(&mut self.reassembly.wire_len);
                return Ok(Some(packet));
            }
        }
    }

    /// Bytes still required to finish the frame at the head of the buffer,
    /// if its header has arrived.
    pub fn missing_bytes(&self) -> Option<usize> {
        declared_frame_len(&self.buffer).map(|len| len.saturating_sub(self.buffer.len()))
    }

    /// Wire bytes, framing included, of the last completed packet.
    pub fn last_wire_len(&self) -> usize {
        self.last_wire_len
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// No partial frame or partial packet is held.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && !self.reassembly.in_progress()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.reassembly.reset();
    }
}
