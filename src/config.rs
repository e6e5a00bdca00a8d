//! Device configuration.
//!
//! Every field has a default matching the 5110 sensor, so an empty file (or
//! no file at all) is a valid configuration. Example:
//!
//! ```toml
//! [usb]
//! product_id = 0x5110
//!
//! [protocol]
//! command_timeout_ms = 2000
//!
//! [tls]
//! enabled = true
//! psk = "0000000000000000000000000000000000000000000000000000000000000000"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT, ENDPOINT_IN, ENDPOINT_OUT, INTERFACE, MAX_FRAME_PAYLOAD, PID_5110, VID,
};
use crate::error::{Error, Result};
use crate::psk::Psk;
use crate::transport::Endpoints;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub usb: UsbConfig,
    pub protocol: ProtocolConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub endpoint_out: u8,
    pub endpoint_in: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Per-transfer timeout for commands that do not set their own.
    pub command_timeout_ms: u64,
    /// Payload bytes per outgoing frame.
    pub max_frame_payload: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Hex-encoded 32-byte PSK. Absent = the zero PSK.
    pub psk: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            usb: UsbConfig::default(),
            protocol: ProtocolConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: VID,
            product_id: PID_5110,
            interface: INTERFACE,
            endpoint_out: ENDPOINT_OUT,
            endpoint_in: ENDPOINT_IN,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            max_frame_payload: MAX_FRAME_PAYLOAD,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            psk: None,
        }
    }
}

impl DeviceConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: DeviceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.usb.endpoint_in & 0x80 == 0 {
            return Err(Error::Config(format!(
                "endpoint_in {:#04x} is not an IN endpoint",
                self.usb.endpoint_in
            )));
        }
        if self.usb.endpoint_out & 0x80 != 0 {
            return Err(Error::Config(format!(
                "endpoint_out {:#04x} is not an OUT endpoint",
                self.usb.endpoint_out
            )));
        }
        if self.protocol.command_timeout_ms == 0 {
            return Err(Error::Config("command_timeout_ms must be positive".into()));
        }
        if self.protocol.max_frame_payload == 0 || self.protocol.max_frame_payload > MAX_FRAME_PAYLOAD {
            return Err(Error::Config(format!(
                "max_frame_payload must be within 1..={MAX_FRAME_PAYLOAD}, got {}",
                self.protocol.max_frame_payload
            )));
        }
        self.psk()?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.command_timeout_ms)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            cmd_out: self.usb.endpoint_out,
            cmd_in: self.usb.endpoint_in,
        }
    }

    pub fn psk(&self) -> Result<Psk> {
        match &self.tls.psk {
            Some(text) => Psk::from_hex(text),
            None => Ok(Psk::zero()),
        }
    }
}
