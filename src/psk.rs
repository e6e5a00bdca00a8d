//! Pre-shared key material for the sensor's TLS channel.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::command::{self, Command};
use crate::constants::{PSK_HASH_ADDRESS, PSK_LEN, PSK_WRITE_ADDRESS, ZERO_PSK_HASH};
use crate::error::{Error, Result};

/// Length of the digests exchanged with the sensor.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte pre-shared key. `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq)]
pub struct Psk([u8; PSK_LEN]);

impl Psk {
    pub fn new(bytes: [u8; PSK_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero key factory-fresh sensors are provisioned with.
    pub fn zero() -> Self {
        Self([0u8; PSK_LEN])
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim()).map_err(|e| Error::Config(format!("PSK is not valid hex: {e}")))?;
        let bytes: [u8; PSK_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| Error::Config(format!("PSK must be {PSK_LEN} bytes, got {}", b.len())))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PSK_LEN] {
        &self.0
    }

    /// SHA-256 of the key, as the sensor reports it after provisioning.
    pub fn digest(&self) -> [u8; DIGEST_LEN] {
        Sha256::digest(self.0).into()
    }

    pub fn write_command(&self) -> Command {
        command::preset_psk_write(PSK_WRITE_ADDRESS, &self.0)
    }

    pub fn read_digest_command() -> Command {
        command::preset_psk_read(PSK_HASH_ADDRESS, DIGEST_LEN as u32)
    }

    /// Check the digest read back from the sensor against this key.
    pub fn verify_digest(&self, reported: &[u8]) -> Result<()> {
        let expected = self.digest();
        if reported != expected.as_slice() {
            return Err(Error::HandshakeVerificationFailed(format!(
                "PSK digest read back as {}, expected {}",
                hex::encode(reported),
                hex::encode(expected)
            )));
        }
        Ok(())
    }
}

impl Default for Psk {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Psk(..)")
    }
}

/// The digest leading the sensor's hello record must be the zero-PSK
/// reference, otherwise the firmware cannot be trusted with a real key.
pub fn verify_zero_psk_hello(hello: &[u8]) -> Result<()> {
    let Some(digest) = hello.get(..DIGEST_LEN) else {
        return Err(Error::HandshakeVerificationFailed(format!(
            "hello record too short for a digest: {} bytes",
            hello.len()
        )));
    };
    if digest != ZERO_PSK_HASH.as_slice() {
        return Err(Error::HandshakeVerificationFailed(format!(
            "hello digest {} does not match the zero-PSK reference",
            hex::encode(digest)
        )));
    }
    Ok(())
}
