//! Common test utilities: a simulated sensor behind the `Transport` trait
//! and a toy TLS engine it understands.

// Shared across several test files; not every item is used in each one.
#![allow(dead_code, unused_imports)]

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};

pub use goodix_rs::command::{self, Reply};
pub use goodix_rs::config::DeviceConfig;
pub use goodix_rs::constants::{
    FIRMWARE_VERSION_SUPPORTED, FLAGS_MSG_PROTOCOL, FLAGS_TLS, PSK_HASH_ADDRESS, PSK_WRITE_ADDRESS, ZERO_PSK_HASH,
};
pub use goodix_rs::error::{ChecksumLayer, Error, ErrorKind, Result};
pub use goodix_rs::message::{Opcode, ProtocolMessage, encode_ack, protocol_checksum};
pub use goodix_rs::packet::{FrameAssembler, Packet};
pub use goodix_rs::psk::Psk;
pub use goodix_rs::sequencer::Sequencer;
pub use goodix_rs::tls::{TlsEngine, TlsPhase, TlsTunnel};
pub use goodix_rs::transport::{CancelToken, CommandChannel, Completed, Direction, Endpoints, Transfer, Transport};
pub use goodix_rs::{Goodix5110, GoodixDevice, ImageDevice, ImageDeviceState, PlainSensor};

/// Server handshake flight the simulated sensor answers a ClientHello with.
pub const SERVER_FLIGHT: &[u8] = &[0x16, 0x03, 0x03, 0x00, 0x04, 0x0e, 0x00, 0x00, 0x00];

/// Client flight the mock engine emits once it has seen [`SERVER_FLIGHT`].
pub const CLIENT_FINISHED: &[u8] = &[0x14, 0x03, 0x03, 0x00, 0x01, 0x01];

const APP_DATA: u8 = 0x17;
const MOCK_KEY: u8 = 0x5a;

/// Record framing of the toy cipher shared by [`MockEngine`] and the
/// simulated sensor.
pub fn mock_seal(plaintext: &[u8]) -> Bytes {
    let mut record = vec![APP_DATA];
    record.extend(plaintext.iter().map(|b| b ^ MOCK_KEY));
    Bytes::from(record)
}

pub fn mock_open(record: &[u8]) -> Result<Bytes> {
    match record.split_first() {
        Some((&APP_DATA, body)) => Ok(body.iter().map(|b| b ^ MOCK_KEY).collect()),
        _ => Err(Error::Tls(format!("not an application record: {}", hex::encode(record)))),
    }
}

/// Sans-IO engine that completes after one server flight.
#[derive(Debug, Default)]
pub struct MockEngine {
    started: bool,
    established: bool,
    outgoing: VecDeque<Bytes>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TlsEngine for MockEngine {
    fn start(&mut self, _psk: &Psk) -> Result<()> {
        if self.started {
            return Err(Error::ProtocolState("mock engine already started".into()));
        }
        self.started = true;
        self.outgoing
            .push_back(Bytes::from_static(&[0x16, 0x03, 0x03, 0x00, 0x03, 0x01, 0x00, 0x00]));
        Ok(())
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        if data != SERVER_FLIGHT {
            return Err(Error::HandshakeVerificationFailed(format!(
                "unexpected server flight {}",
                hex::encode(data)
            )));
        }
        self.outgoing.push_back(Bytes::from_static(CLIENT_FINISHED));
        self.established = true;
        Ok(())
    }

    fn take_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        Ok(mock_seal(plaintext))
    }

    fn open(&mut self, record: &[u8]) -> Result<Bytes> {
        mock_open(record)
    }
}

/// A protocol packet as the sensor would put it on the wire.
pub fn protocol_wire(message: impl Into<Bytes>) -> Bytes {
    Packet::new(FLAGS_MSG_PROTOCOL, message).to_wire().unwrap()
}

pub fn ack_wire(opcode: Opcode) -> Bytes {
    protocol_wire(encode_ack(opcode, 0x01))
}

pub fn data_wire(opcode: Opcode, data: impl Into<Bytes>) -> Bytes {
    protocol_wire(ProtocolMessage::new(opcode, data).encode())
}

pub fn tls_wire(record: &[u8]) -> Bytes {
    let mut payload = vec![u8::from(Opcode::TlsRecord)];
    payload.extend_from_slice(record);
    Packet::new(FLAGS_TLS, payload).to_wire().unwrap()
}

/// The hello a factory-fresh sensor sends after a TLS connection request.
pub fn zero_psk_hello() -> Vec<u8> {
    let mut hello = ZERO_PSK_HASH.to_vec();
    hello.extend_from_slice(&[0x16, 0x03, 0x03]);
    hello
}

/// In-process model of the sensor's command endpoint.
///
/// Replies are generated from what the host writes and queued for the IN
/// endpoint. An IN transfer returns at most the requested length and stays
/// pending forever when nothing is queued, so a missing reply shows up as a
/// timeout.
pub struct SimulatedSensor {
    pub firmware: String,
    pub hello: Vec<u8>,
    /// Digest reported for the stored PSK instead of the real one.
    pub psk_digest: Option<[u8; 32]>,
    pub image: Vec<u8>,
    pub mcu_state: Vec<u8>,
    /// Raw replies per opcode, replacing the generated ones. An empty list
    /// means the sensor never answers.
    pub overrides: HashMap<u8, Vec<Bytes>>,
    /// Report one byte less than written on every OUT transfer.
    pub short_write: bool,

    /// Every OUT transfer, as written.
    pub writes: Vec<Bytes>,
    /// Every packet reassembled from the OUT transfers.
    pub received: Vec<Packet>,
    /// Endpoint of every IN transfer.
    pub reads_from: Vec<u8>,
    pub stored_psk: Option<Vec<u8>>,
    pub tls_up: bool,
    /// Whether the host currently holds the interface.
    pub claimed: bool,
    /// Number of claims so far.
    pub claims: usize,

    assembler: FrameAssembler,
    inbox: BytesMut,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self {
            firmware: FIRMWARE_VERSION_SUPPORTED.to_string(),
            hello: zero_psk_hello(),
            psk_digest: None,
            image: (0..100u8).collect(),
            mcu_state: vec![0x0f, 0x00, 0x01, 0x20, 0x00, 0x00],
            overrides: HashMap::new(),
            short_write: false,
            writes: Vec::new(),
            received: Vec::new(),
            reads_from: Vec::new(),
            stored_psk: None,
            tls_up: false,
            claimed: false,
            claims: 0,
            assembler: FrameAssembler::new(),
            inbox: BytesMut::new(),
        }
    }
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_firmware(mut self, firmware: &str) -> Self {
        self.firmware = firmware.to_string();
        self
    }

    /// Never answer `opcode`.
    pub fn mute(mut self, opcode: Opcode) -> Self {
        self.overrides.insert(opcode.into(), Vec::new());
        self
    }

    /// Answer `opcode` with `replies` instead of the generated ones.
    pub fn reply_with(mut self, opcode: Opcode, replies: Vec<Bytes>) -> Self {
        self.overrides.insert(opcode.into(), replies);
        self
    }

    /// Opcodes of the protocol messages received so far, in order.
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.received
            .iter()
            .filter(|p| p.flags == FLAGS_MSG_PROTOCOL)
            .map(|p| Opcode::from(p.payload[0]))
            .collect()
    }

    /// TLS records received from the host.
    pub fn tls_records(&self) -> Vec<Bytes> {
        self.received
            .iter()
            .filter(|p| p.flags == FLAGS_TLS)
            .map(|p| p.payload.slice(1..))
            .collect()
    }

    pub fn pending_input(&self) -> usize {
        self.inbox.len()
    }

    fn queue(&mut self, wire: Bytes) {
        self.inbox.extend_from_slice(&wire);
    }

    fn handle(&mut self, packet: Packet) {
        match packet.flags {
            FLAGS_MSG_PROTOCOL => self.handle_message(&packet.payload),
            FLAGS_TLS => self.handle_record(packet.payload.slice(1..)),
            other => panic!("host sent packet with flags {other:#04x}"),
        }
        self.received.push(packet);
    }

    fn handle_message(&mut self, message: &[u8]) {
        let opcode = Opcode::from(message[0]);
        let args = if opcode == Opcode::Nop {
            &message[1..]
        } else {
            let (body, checksum) = message.split_at(message.len() - 1);
            assert_eq!(checksum[0], protocol_checksum(body[0], &body[1..]), "host checksum for {opcode:?}");
            &body[1..]
        };

        if let Some(replies) = self.overrides.get(&u8::from(opcode)).cloned() {
            for reply in replies {
                self.queue(reply);
            }
            return;
        }

        match opcode {
            Opcode::Nop => {}
            Opcode::FirmwareVersion => {
                self.queue(ack_wire(opcode));
                let mut data = vec![0x00; 3];
                data.extend_from_slice(self.firmware.as_bytes());
                data.push(0x00);
                self.queue(data_wire(opcode, data));
            }
            Opcode::QueryMcuState => {
                self.queue(ack_wire(opcode));
                self.queue(data_wire(opcode, self.mcu_state.clone()));
            }
            Opcode::ReadSensorRegister => {
                let length = usize::from(args[3]);
                self.queue(ack_wire(opcode));
                self.queue(data_wire(opcode, vec![0xa5; length]));
            }
            Opcode::RequestTlsConnection => {
                self.queue(ack_wire(opcode));
                let hello = self.hello.clone();
                self.queue(tls_wire(&hello));
            }
            Opcode::PresetPskWriteR => {
                let length = u32::from_le_bytes([args[4], args[5], args[6], args[7]]) as usize;
                self.stored_psk = Some(args[8..8 + length].to_vec());
                self.queue(ack_wire(opcode));
            }
            Opcode::PresetPskReadR => {
                let digest = self.psk_digest.unwrap_or_else(|| {
                    let key: [u8; 32] = self
                        .stored_psk
                        .clone()
                        .unwrap_or_else(|| vec![0; 32])
                        .try_into()
                        .unwrap();
                    Psk::new(key).digest()
                });
                let mut data = args[..8].to_vec();
                data.extend_from_slice(&digest);
                self.queue(ack_wire(opcode));
                self.queue(data_wire(opcode, data));
            }
            Opcode::TlsSuccessfullyEstablished => {
                self.tls_up = true;
                self.queue(ack_wire(opcode));
            }
            Opcode::McuGetImage => {
                self.queue(ack_wire(opcode));
                let image = self.image.clone();
                if self.tls_up {
                    self.queue(tls_wire(&mock_seal(&image)));
                } else {
                    self.queue(data_wire(opcode, image));
                }
            }
            _ => self.queue(ack_wire(opcode)),
        }
    }

    fn handle_record(&mut self, record: Bytes) {
        match record.first().copied() {
            // ClientHello
            Some(0x16) => self.queue(tls_wire(SERVER_FLIGHT)),
            // Echo application data.
            Some(APP_DATA) => {
                let plaintext = mock_open(&record).unwrap();
                self.queue(tls_wire(&mock_seal(&plaintext)));
            }
            _ => {}
        }
    }
}

impl Transport for SimulatedSensor {
    async fn submit(&mut self, transfer: Transfer) -> Result<Completed> {
        match transfer.direction {
            Direction::Out => {
                self.writes.push(transfer.buffer.clone());
                if let Some(packet) = self.assembler.push(&transfer.buffer).expect("host frame") {
                    self.handle(packet);
                }
                let actual_length = if self.short_write {
                    transfer.length - 1
                } else {
                    transfer.length
                };
                Ok(Completed {
                    direction: Direction::Out,
                    data: Bytes::new(),
                    actual_length,
                })
            }
            Direction::In => {
                self.reads_from.push(transfer.endpoint);
                if self.inbox.is_empty() {
                    std::future::pending::<()>().await;
                }
                let n = transfer.length.min(self.inbox.len());
                let data = self.inbox.split_to(n).freeze();
                Ok(Completed {
                    direction: Direction::In,
                    actual_length: data.len(),
                    data,
                })
            }
        }
    }

    async fn claim(&mut self) -> Result<()> {
        assert!(!self.claimed, "interface claimed twice");
        self.claimed = true;
        self.claims += 1;
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.claimed = false;
        Ok(())
    }
}

pub fn channel(sensor: SimulatedSensor) -> CommandChannel<SimulatedSensor> {
    CommandChannel::new(sensor, Endpoints::default(), CancelToken::new())
}

pub fn plain_sensor() -> PlainSensor {
    PlainSensor {
        product_id: 0x5117,
        firmware: FIRMWARE_VERSION_SUPPORTED.to_string(),
        image_endpoint: None,
    }
}

pub fn config_without_tls() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.tls.enabled = false;
    config
}

/// An opened 5110 wired to `sensor` with the mock engine installed.
pub async fn open_5110(sensor: SimulatedSensor) -> GoodixDevice<SimulatedSensor, Goodix5110> {
    let mut device = GoodixDevice::new(sensor, Goodix5110, &DeviceConfig::default())
        .unwrap()
        .with_tls_engine(MockEngine::new);
    device.open().await.unwrap();
    device
}

/// An opened clear-text sensor wired to `sensor`.
pub async fn open_plain(sensor: SimulatedSensor) -> GoodixDevice<SimulatedSensor, PlainSensor> {
    let mut device = GoodixDevice::new(sensor, plain_sensor(), &DeviceConfig::default()).unwrap();
    device.open().await.unwrap();
    device
}
