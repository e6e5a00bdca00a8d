//! [`TlsEngine`] on OpenSSL: TLS 1.2, `PSK-AES128-GCM-SHA256`, no
//! certificates.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use bytes::Bytes;
use openssl::error::ErrorStack;
use openssl::ssl::{
    HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslMethod, SslStream, SslVerifyMode, SslVersion,
};

use super::TlsEngine;
use crate::error::{Error, Result};
use crate::psk::Psk;

pub const CIPHER_SUITE: &str = "PSK-AES128-GCM-SHA256";

const PSK_IDENTITY: &[u8] = b"Client_identity\0";

/// In-memory stand-in for a socket. Reads report `WouldBlock` when the peer
/// has not sent anything yet.
#[derive(Debug, Default)]
struct MemoryPipe {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
}

impl Read for MemoryPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum State {
    Idle,
    Handshaking(MidHandshakeSslStream<MemoryPipe>),
    Established(SslStream<MemoryPipe>),
    Failed,
}

pub struct OpensslEngine {
    state: State,
}

impl OpensslEngine {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    fn context(psk: &Psk) -> Result<SslContext, ErrorStack> {
        let mut builder = SslContext::builder(SslMethod::tls_client())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_cipher_list(CIPHER_SUITE)?;
        builder.set_verify(SslVerifyMode::NONE);

        let key = *psk.as_bytes();
        builder.set_psk_client_callback(move |_ssl, _hint, identity, psk_out| {
            if identity.len() < PSK_IDENTITY.len() || psk_out.len() < key.len() {
                return Err(ErrorStack::get());
            }
            identity[..PSK_IDENTITY.len()].copy_from_slice(PSK_IDENTITY);
            psk_out[..key.len()].copy_from_slice(&key);
            Ok(key.len())
        });
        Ok(builder.build())
    }

    fn handshake_result(
        &mut self,
        result: std::result::Result<SslStream<MemoryPipe>, HandshakeError<MemoryPipe>>,
    ) -> Result<()> {
        match result {
            Ok(stream) => {
                self.state = State::Established(stream);
                Ok(())
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.state = State::Handshaking(mid);
                Ok(())
            }
            Err(HandshakeError::Failure(mid)) => {
                self.state = State::Failed;
                Err(Error::HandshakeVerificationFailed(mid.error().to_string()))
            }
            Err(HandshakeError::SetupFailure(stack)) => {
                self.state = State::Failed;
                Err(Error::Tls(stack.to_string()))
            }
        }
    }

    fn stream(&mut self) -> Result<&mut SslStream<MemoryPipe>> {
        match &mut self.state {
            State::Established(stream) => Ok(stream),
            _ => Err(Error::ProtocolState("TLS engine has no established session".into())),
        }
    }
}

impl Default for OpensslEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsEngine for OpensslEngine {
    fn start(&mut self, psk: &Psk) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(Error::ProtocolState("TLS engine already started".into()));
        }
        let context = Self::context(psk).map_err(|e| Error::Tls(e.to_string()))?;
        let ssl = Ssl::new(&context).map_err(|e| Error::Tls(e.to_string()))?;
        let result = ssl.connect(MemoryPipe::default());
        self.handshake_result(result)
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::Handshaking(mut mid) => {
                mid.get_mut().incoming.extend(data);
                let result = mid.handshake();
                self.handshake_result(result)
            }
            State::Established(mut stream) => {
                stream.get_mut().incoming.extend(data);
                self.state = State::Established(stream);
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::ProtocolState("TLS engine is not handshaking".into()))
            }
        }
    }

    fn take_outgoing(&mut self) -> Option<Bytes> {
        let pipe = match &mut self.state {
            State::Handshaking(mid) => mid.get_mut(),
            State::Established(stream) => stream.get_mut(),
            State::Idle | State::Failed => return None,
        };
        if pipe.outgoing.is_empty() {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut pipe.outgoing)))
    }

    fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        let stream = self.stream()?;
        stream
            .write_all(plaintext)
            .map_err(|e| Error::Tls(format!("seal failed: {e}")))?;
        Ok(Bytes::from(std::mem::take(&mut stream.get_mut().outgoing)))
    }

    fn open(&mut self, record: &[u8]) -> Result<Bytes> {
        let stream = self.stream()?;
        stream.get_mut().incoming.extend(record);
        let mut plaintext = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(Error::Tls(err.to_string())),
            }
        }
        Ok(Bytes::from(plaintext))
    }
}
