//! Bulk transfers to and from the sensor.
//!
//! [`Transport`] is the raw I/O boundary: one directed transfer in, one
//! completion out. [`CommandChannel`] sits on top of it and owns the policy
//! every caller shares: per-transfer timeouts, cancellation, frame splitting
//! on the way out and frame reassembly on the way in.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nusb::Interface;
use nusb::transfer::RequestBuffer;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::constants::{ENDPOINT_IN, ENDPOINT_OUT, EP_IN_MAX_BUF_SIZE, EP_IN_MAX_PACKET_SIZE, MAX_FRAME_PAYLOAD};
use crate::error::{Error, Result, TransportError};
use crate::packet::{FrameAssembler, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Direction {
    #[strum(to_string = "OUT")]
    Out,
    #[strum(to_string = "IN")]
    In,
}

/// A single bulk transfer request.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub direction: Direction,
    pub endpoint: u8,
    /// Bytes to send. Empty for IN transfers.
    pub buffer: Bytes,
    /// Bytes to send, or the largest read accepted.
    pub length: usize,
    pub timeout: Duration,
}

impl Transfer {
    pub fn bulk_out(endpoint: u8, data: Bytes, timeout: Duration) -> Self {
        Self {
            direction: Direction::Out,
            endpoint,
            length: data.len(),
            buffer: data,
            timeout,
        }
    }

    pub fn bulk_in(endpoint: u8, length: usize, timeout: Duration) -> Self {
        Self {
            direction: Direction::In,
            endpoint,
            buffer: Bytes::new(),
            length,
            timeout,
        }
    }
}

/// Result of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub direction: Direction,
    /// Received bytes. Empty for OUT transfers.
    pub data: Bytes,
    pub actual_length: usize,
}

/// Raw transfer boundary.
///
/// Implementations perform the transfer and nothing else; timeouts and
/// cancellation are applied by [`CommandChannel`], which drops the returned
/// future to abort a transfer.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn submit(&mut self, transfer: Transfer) -> Result<Completed>;

    /// Take exclusive use of the device's interface. Called when the device
    /// is opened.
    async fn claim(&mut self) -> Result<()> {
        Ok(())
    }

    /// Give the interface back. Called when the device is closed.
    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The sensor's USB interface, claimed between `claim` and `release`.
pub struct UsbTransport {
    device: nusb::Device,
    interface_number: u8,
    interface: Option<Interface>,
}

impl UsbTransport {
    /// Open the first device matching `vid`/`pid`. `interface` is claimed
    /// later, by [`Transport::claim`].
    pub fn open(vid: u16, pid: u16, interface: u8) -> Result<Self> {
        info!("Searching for Goodix sensor {:04x}:{:04x}...", vid, pid);
        let device_info = nusb::list_devices()?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(Error::DeviceNotFound)?;

        info!(
            "Found device on bus {} addr {}",
            device_info.bus_number(),
            device_info.device_address()
        );

        Ok(Self {
            device: device_info.open()?,
            interface_number: interface,
            interface: None,
        })
    }

    fn interface(&self) -> Result<&Interface> {
        self.interface.as_ref().ok_or(Error::Transport(TransportError::Closed))
    }
}

impl Transport for UsbTransport {
    async fn submit(&mut self, transfer: Transfer) -> Result<Completed> {
        let interface = self.interface()?;
        match transfer.direction {
            Direction::Out => {
                debug!(endpoint = transfer.endpoint, bytes = hex::encode(&transfer.buffer), "USB Write");
                let completion = interface.bulk_out(transfer.endpoint, transfer.buffer.to_vec()).await;
                let sent = completion.into_result()?;
                Ok(Completed {
                    direction: Direction::Out,
                    data: Bytes::new(),
                    actual_length: sent.actual_length(),
                })
            }
            Direction::In => {
                // IN requests must be whole max-size packets or the host
                // controller reports an overflow.
                let length = transfer.length.max(1).div_ceil(EP_IN_MAX_PACKET_SIZE) * EP_IN_MAX_PACKET_SIZE;
                let completion = interface.bulk_in(transfer.endpoint, RequestBuffer::new(length)).await;
                let data = completion.into_result()?;
                debug!(endpoint = transfer.endpoint, bytes = hex::encode(&data), "USB Read");
                Ok(Completed {
                    direction: Direction::In,
                    actual_length: data.len(),
                    data: Bytes::from(data),
                })
            }
        }
    }

    async fn claim(&mut self) -> Result<()> {
        if self.interface.is_none() {
            self.interface = Some(self.device.detach_and_claim_interface(self.interface_number)?);
            info!(interface = self.interface_number, "Interface claimed successfully.");
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        // Dropping the last handle releases the interface.
        if self.interface.take().is_some() {
            info!(interface = self.interface_number, "Interface released.");
        }
        Ok(())
    }
}

/// Cloneable cancellation signal shared between a host and the channel
/// performing I/O for it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Re-arm after a cancelled run so the device can be used again.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the token, so this only
        // fails if every token is gone, in which case nobody can cancel.
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoint pair used for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub cmd_out: u8,
    pub cmd_in: u8,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            cmd_out: ENDPOINT_OUT,
            cmd_in: ENDPOINT_IN,
        }
    }
}

/// Packet-level I/O over a [`Transport`].
///
/// `&mut self` on every method keeps at most one transfer outstanding.
pub struct CommandChannel<T> {
    transport: T,
    endpoints: Endpoints,
    max_frame_payload: usize,
    cancel: CancelToken,
    assembler: FrameAssembler,
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(transport: T, endpoints: Endpoints, cancel: CancelToken) -> Self {
        Self {
            transport,
            endpoints,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            cancel,
            assembler: FrameAssembler::new(),
        }
    }

    pub fn with_max_frame_payload(mut self, max_frame_payload: usize) -> Self {
        self.max_frame_payload = max_frame_payload;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Submit one transfer, bounded by its timeout and by the cancel token.
    pub async fn transfer(&mut self, transfer: Transfer) -> Result<Completed> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let direction = transfer.direction;
        let timeout = transfer.timeout;
        let cancel = self.cancel.clone();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%direction, "Transfer cancelled");
                Err(Error::Cancelled)
            }
            result = tokio::time::timeout(timeout, self.transport.submit(transfer)) => match result {
                Ok(completed) => completed,
                Err(_) => Err(TransportError::Timeout { direction, timeout }.into()),
            },
        }
    }

    /// Write `packet`, one OUT transfer per frame.
    pub async fn send_packet(&mut self, packet: &Packet, timeout: Duration) -> Result<()> {
        trace!(flags = packet.flags, payload = hex::encode(&packet.payload), "Sending packet");
        for frame in packet.encode(self.max_frame_payload)? {
            let expected = frame.len();
            let completed = self
                .transfer(Transfer::bulk_out(self.endpoints.cmd_out, frame, timeout))
                .await?;
            if completed.actual_length != expected {
                return Err(Error::UnexpectedResponseLength {
                    expected,
                    actual: completed.actual_length,
                });
            }
        }
        Ok(())
    }

    /// Read IN transfers until a whole packet has been reassembled.
    ///
    /// `len_hint` sizes the first request; later requests ask for whatever
    /// the partially received frame still needs. `timeout` bounds the whole
    /// packet, not each transfer, so a device sending zero-length or
    /// one-byte reads still times out. Any failure discards the partial
    /// packet.
    pub async fn read_packet(&mut self, len_hint: usize, timeout: Duration) -> Result<Packet> {
        self.read_packet_from(self.endpoints.cmd_in, len_hint, timeout).await
    }

    /// [`read_packet`](Self::read_packet) on an IN endpoint other than the
    /// command one, such as a dedicated image endpoint.
    pub async fn read_packet_from(&mut self, endpoint: u8, len_hint: usize, timeout: Duration) -> Result<Packet> {
        let result = self.read_packet_inner(endpoint, len_hint, timeout).await;
        if result.is_err() {
            self.assembler.reset();
        }
        result
    }

    async fn read_packet_inner(&mut self, endpoint: u8, len_hint: usize, timeout: Duration) -> Result<Packet> {
        let deadline = Instant::now() + timeout;
        let timed_out = || {
            Error::from(TransportError::Timeout {
                direction: Direction::In,
                timeout,
            })
        };
        loop {
            if let Some(packet) = self.assembler.next_packet()? {
                trace!(flags = packet.flags, payload = hex::encode(&packet.payload), "Received packet");
                return Ok(packet);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            let length = match self.assembler.missing_bytes() {
                Some(missing) if missing > 0 => missing,
                _ => len_hint,
            }
            .clamp(1, EP_IN_MAX_BUF_SIZE);

            let completed = match self.transfer(Transfer::bulk_in(endpoint, length, remaining)).await {
                Err(err) if err.is_timeout() => return Err(timed_out()),
                other => other?,
            };
            if completed.data.is_empty() {
                trace!("Zero-length read, waiting for more data");
                // Let the cancel task run against an always-ready transport.
                tokio::task::yield_now().await;
                continue;
            }
            self.assembler.extend(&completed.data);
        }
    }

    /// Wire size of the packet most recently returned by
    /// [`read_packet`](Self::read_packet).
    pub fn last_packet_wire_len(&self) -> usize {
        self.assembler.last_wire_len()
    }

    /// Drop any buffered partial input.
    pub fn discard_input(&mut self) {
        if !self.assembler.is_idle() {
            debug!(buffered = self.assembler.buffered(), "Discarding buffered input");
        }
        self.assembler.reset();
    }
}
