//! PSK-TLS tunnel carried over the framed command channel.
//!
//! The sensor only talks TLS after two checks: the hello it sends in reply to
//! "request TLS connection" must lead with the zero-PSK reference digest, and
//! the digest of the PSK written to it must read back correctly. The
//! handshake itself is delegated to a sans-IO [`TlsEngine`]; every record it
//! produces or consumes travels as a `TlsRecord` message in TLS-flagged
//! frames.

#[cfg(feature = "openssl")]
pub mod openssl;

use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use num_enum::TryFromPrimitive;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::command::{self, Reply};
use crate::constants::EP_IN_MAX_BUF_SIZE;
use crate::error::{Error, Result};
use crate::psk::{self, DIGEST_LEN, Psk};
use crate::sequencer::{Operation, Sequencer, Step};
use crate::transport::{CancelToken, CommandChannel, Transport};

/// A TLS client that never touches I/O itself.
///
/// Bytes from the peer go in through [`feed`](Self::feed) or
/// [`open`](Self::open); bytes for the peer come out of
/// [`take_outgoing`](Self::take_outgoing) or [`seal`](Self::seal).
pub trait TlsEngine {
    /// Begin a handshake authenticated by `psk`. The ClientHello becomes
    /// available from `take_outgoing`.
    fn start(&mut self, psk: &Psk) -> Result<()>;

    /// Handshake bytes received from the peer.
    fn feed(&mut self, data: &[u8]) -> Result<()>;

    /// Pending bytes for the peer, if any.
    fn take_outgoing(&mut self) -> Option<Bytes>;

    fn is_established(&self) -> bool;

    /// Encrypt application data into record bytes.
    fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes>;

    /// Decrypt record bytes into application data.
    fn open(&mut self, record: &[u8]) -> Result<Bytes>;
}

impl<E: TlsEngine + ?Sized> TlsEngine for Box<E> {
    fn start(&mut self, psk: &Psk) -> Result<()> {
        (**self).start(psk)
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        (**self).feed(data)
    }

    fn take_outgoing(&mut self) -> Option<Bytes> {
        (**self).take_outgoing()
    }

    fn is_established(&self) -> bool {
        (**self).is_established()
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        (**self).seal(plaintext)
    }

    fn open(&mut self, record: &[u8]) -> Result<Bytes> {
        (**self).open(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum TlsPhase {
    Idle,
    ClientHelloSent,
    KeyExchange,
    Established,
    Failed,
}

/// Handshake bookkeeping for one tunnel.
pub struct TlsSession {
    phase: TlsPhase,
    psk: Psk,
    transcript: Sha256,
    hello_digest: Option<[u8; DIGEST_LEN]>,
}

impl TlsSession {
    pub fn new(psk: Psk) -> Self {
        Self {
            phase: TlsPhase::Idle,
            psk,
            transcript: Sha256::new(),
            hello_digest: None,
        }
    }

    pub fn phase(&self) -> TlsPhase {
        self.phase
    }

    pub fn psk(&self) -> &Psk {
        &self.psk
    }

    /// Digest carried by the sensor's hello, once received.
    pub fn hello_digest(&self) -> Option<&[u8; DIGEST_LEN]> {
        self.hello_digest.as_ref()
    }

    /// SHA-256 over every handshake byte exchanged so far.
    pub fn transcript_digest(&self) -> [u8; DIGEST_LEN] {
        self.transcript.clone().finalize().into()
    }

    fn record(&mut self, bytes: &[u8]) {
        self.transcript.update(bytes);
    }

    /// Move forward one phase. Anything else is an engine bug.
    fn advance(&mut self, to: TlsPhase) -> Result<()> {
        let allowed = matches!(
            (self.phase, to),
            (TlsPhase::Idle, TlsPhase::ClientHelloSent)
                | (TlsPhase::ClientHelloSent, TlsPhase::KeyExchange)
                | (TlsPhase::KeyExchange, TlsPhase::Established)
        );
        if !allowed {
            return Err(Error::ProtocolState(format!(
                "illegal TLS phase transition {} -> {}",
                self.phase, to
            )));
        }
        debug!(from = %self.phase, to = %to, "TLS phase");
        self.phase = to;
        Ok(())
    }

    /// Enter `Failed`, dropping everything learned during the attempt.
    fn fail(&mut self) {
        self.phase = TlsPhase::Failed;
        self.transcript = Sha256::new();
        self.hello_digest = None;
    }

    fn require_established(&self) -> Result<()> {
        if self.phase != TlsPhase::Established {
            return Err(Error::ProtocolState(format!(
                "TLS tunnel is {}, not established",
                self.phase
            )));
        }
        Ok(())
    }
}

/// A [`TlsEngine`] bound to a session.
pub struct TlsTunnel<E> {
    engine: E,
    session: TlsSession,
}

impl<E: TlsEngine> TlsTunnel<E> {
    pub fn new(engine: E, psk: Psk) -> Self {
        Self {
            engine,
            session: TlsSession::new(psk),
        }
    }

    pub fn phase(&self) -> TlsPhase {
        self.session.phase()
    }

    pub fn session(&self) -> &TlsSession {
        &self.session
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run the full handshake as one sequencer operation. On failure the
    /// session ends up `Failed` and cannot be reused.
    pub async fn establish<T: Transport>(
        &mut self,
        sequencer: &Sequencer,
        channel: &mut CommandChannel<T>,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<()> {
        if self.session.phase() != TlsPhase::Idle {
            return Err(Error::ProtocolState(format!(
                "cannot start a TLS handshake in phase {}",
                self.session.phase()
            )));
        }

        let mut op = Handshake {
            tunnel: self,
            timeout,
            hello: None,
            _transport: PhantomData,
        };
        let result = sequencer.execute(&mut op, channel, cancel).await;
        match &result {
            Ok(()) => info!("TLS tunnel established"),
            Err(err) => {
                warn!("TLS handshake failed: {}", err);
                self.session.fail();
            }
        }
        result
    }

    pub async fn send_application_data<T: Transport>(
        &mut self,
        channel: &mut CommandChannel<T>,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        self.session.require_established()?;
        let record = self.engine.seal(data)?;
        command::tls_record(record).execute(channel, timeout).await?;
        Ok(())
    }

    pub async fn receive_application_data<T: Transport>(
        &mut self,
        channel: &mut CommandChannel<T>,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.session.require_established()?;
        let packet = channel.read_packet(EP_IN_MAX_BUF_SIZE, timeout).await?;
        let record = command::decode_record(packet)?;
        self.engine.open(&record)
    }

    /// Decrypt a record obtained outside the tunnel, such as an image.
    pub fn open_record(&mut self, record: &[u8]) -> Result<Bytes> {
        self.session.require_established()?;
        self.engine.open(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum HandshakeState {
    RequestConnection,
    VerifyHello,
    WritePsk,
    VerifyPsk,
    ExchangeRecords,
    ConfirmEstablished,
}

struct Handshake<'a, E, T> {
    tunnel: &'a mut TlsTunnel<E>,
    timeout: Duration,
    hello: Option<Bytes>,
    _transport: PhantomData<T>,
}

impl<E: TlsEngine, T: Transport> Handshake<'_, E, T> {
    async fn request_connection(&mut self, channel: &mut CommandChannel<T>) -> Result<()> {
        let hello = command::request_tls_connection()
            .execute(channel, self.timeout)
            .await?
            .into_data()?;
        debug!(bytes = hex::encode(&hello), "Sensor hello");
        self.tunnel.session.record(&hello);
        self.tunnel.session.advance(TlsPhase::ClientHelloSent)?;
        self.hello = Some(hello);
        Ok(())
    }

    fn verify_hello(&mut self) -> Result<()> {
        let hello = self
            .hello
            .take()
            .ok_or_else(|| Error::ProtocolState("hello verification before the hello arrived".into()))?;
        psk::verify_zero_psk_hello(&hello)?;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&hello[..DIGEST_LEN]);
        self.tunnel.session.hello_digest = Some(digest);
        Ok(())
    }

    async fn write_psk(&mut self, channel: &mut CommandChannel<T>) -> Result<()> {
        self.tunnel.session.advance(TlsPhase::KeyExchange)?;
        let write = self.tunnel.session.psk().write_command();
        write.execute(channel, self.timeout).await?;
        Ok(())
    }

    async fn verify_psk(&mut self, channel: &mut CommandChannel<T>) -> Result<()> {
        let reported = Psk::read_digest_command()
            .execute(channel, self.timeout)
            .await?
            .into_data()?;
        self.tunnel.session.psk().verify_digest(&reported)
    }

    async fn exchange_records(&mut self, channel: &mut CommandChannel<T>) -> Result<()> {
        let tunnel = &mut *self.tunnel;
        tunnel.engine.start(&tunnel.session.psk)?;
        loop {
            while let Some(out) = tunnel.engine.take_outgoing() {
                tunnel.session.record(&out);
                command::tls_record(out).execute(channel, self.timeout).await?;
            }
            if tunnel.engine.is_established() {
                return Ok(());
            }
            let packet = channel.read_packet(EP_IN_MAX_BUF_SIZE, self.timeout).await?;
            let record = command::decode_record(packet)?;
            tunnel.session.record(&record);
            tunnel.engine.feed(&record)?;
        }
    }

    async fn confirm(&mut self, channel: &mut CommandChannel<T>) -> Result<()> {
        match command::tls_successfully_established()
            .execute(channel, self.timeout)
            .await?
        {
            Reply::Acked(_) => self.tunnel.session.advance(TlsPhase::Established),
            other => Err(Error::MalformedResponse(format!("unexpected reply {other:?}"))),
        }
    }
}

impl<E: TlsEngine, T: Transport> Operation for Handshake<'_, E, T> {
    type State = HandshakeState;
    type Context = CommandChannel<T>;

    const NAME: &'static str = "tls_handshake";
    const NUM_STATES: u8 = 6;

    async fn run_state(&mut self, state: HandshakeState, channel: &mut CommandChannel<T>) -> Step {
        match state {
            HandshakeState::RequestConnection => self.request_connection(channel).await.into(),
            HandshakeState::VerifyHello => self.verify_hello().into(),
            HandshakeState::WritePsk => self.write_psk(channel).await.into(),
            HandshakeState::VerifyPsk => self.verify_psk(channel).await.into(),
            HandshakeState::ExchangeRecords => self.exchange_records(channel).await.into(),
            HandshakeState::ConfirmEstablished => self.confirm(channel).await.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_phases_only_move_forward() {
        let mut session = TlsSession::new(Psk::zero());
        assert!(session.advance(TlsPhase::KeyExchange).unwrap_err().is_fatal());
        session.advance(TlsPhase::ClientHelloSent).unwrap();
        session.advance(TlsPhase::KeyExchange).unwrap();
        assert!(session.advance(TlsPhase::ClientHelloSent).is_err());
        session.advance(TlsPhase::Established).unwrap();
        assert!(session.require_established().is_ok());
    }

    #[test]
    fn test_fail_discards_transcript() {
        let mut session = TlsSession::new(Psk::zero());
        let empty = session.transcript_digest();
        session.record(b"hello");
        assert_ne!(session.transcript_digest(), empty);
        session.fail();
        assert_eq!(session.phase(), TlsPhase::Failed);
        assert_eq!(session.transcript_digest(), empty);
        assert_eq!(
            session.require_established().unwrap_err().kind(),
            ErrorKind::ProtocolStateError
        );
    }
}
