use std::time::Duration;

use nusb::transfer::TransferError;
use thiserror::Error;

use crate::transport::Direction;

/// The primary error type for the `goodix-rs` library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("USB device not found. Is the Goodix sensor connected?")]
    DeviceNotFound,

    /// `nusb::Error` is `std::io::Error`, so this also absorbs plain I/O errors.
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{layer} checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        layer: ChecksumLayer,
        expected: u8,
        actual: u8,
    },

    #[error("unexpected response length: expected {expected} bytes, got {actual}")]
    UnexpectedResponseLength { expected: usize, actual: usize },

    #[error("unsupported firmware {found:?}, expected {expected:?}")]
    UnsupportedFirmware { found: String, expected: String },

    #[error("handshake verification failed: {0}")]
    HandshakeVerificationFailed(String),

    #[error("protocol state error: {0}")]
    ProtocolState(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Failures of a single bulk transfer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{direction:?} transfer timed out after {timeout:?}")]
    Timeout { direction: Direction, timeout: Duration },

    #[error("USB transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("transport closed")]
    Closed,
}

/// Which layer's checksum failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ChecksumLayer {
    #[strum(to_string = "frame")]
    Frame,
    #[strum(to_string = "protocol")]
    Protocol,
}

/// Coarse classification of [`Error`], used by hosts to decide how to report a
/// failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    TransportError,
    Cancelled,
    ChecksumError,
    UnexpectedResponseLength,
    UnsupportedFirmware,
    HandshakeVerificationFailed,
    ProtocolStateError,
    MalformedResponse,
    TlsError,
    UsbError,
    ConfigError,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceNotFound | Error::Usb(_) => ErrorKind::UsbError,
            Error::Transport(_) => ErrorKind::TransportError,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Checksum { .. } => ErrorKind::ChecksumError,
            Error::UnexpectedResponseLength { .. } => ErrorKind::UnexpectedResponseLength,
            Error::UnsupportedFirmware { .. } => ErrorKind::UnsupportedFirmware,
            Error::HandshakeVerificationFailed(_) => ErrorKind::HandshakeVerificationFailed,
            Error::ProtocolState(_) => ErrorKind::ProtocolStateError,
            Error::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Error::Tls(_) => ErrorKind::TlsError,
            Error::Config(_) => ErrorKind::ConfigError,
        }
    }

    /// Whether the error is a transfer timeout, as opposed to a deliberate
    /// cancellation or any other failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Timeout { .. }))
    }

    /// Invariant violations inside the engine itself, never caused by the device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolState(_))
    }
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        Error::Transport(TransportError::Transfer(err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts_once() {
        let err: Error = std::io::Error::other("pipe gone").into();
        assert!(matches!(err, Error::Usb(_)));
        assert_eq!(err.kind(), ErrorKind::UsbError);
    }

    #[test]
    fn test_timeout_is_not_cancellation() {
        let err: Error = TransportError::Timeout {
            direction: Direction::In,
            timeout: Duration::from_millis(5),
        }
        .into();
        assert!(err.is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }
}
