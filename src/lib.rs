pub mod command;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod message;
pub mod packet;
pub mod psk;
pub mod sequencer;
pub mod tls;
pub mod transport;

// Re-export the driver entry points for easy access
pub use config::DeviceConfig;
pub use device::{Goodix5110, GoodixDevice, ImageDevice, ImageDeviceState, PlainSensor, SensorVariant};
pub use error::{Error, ErrorKind, Result};
pub use transport::{CancelToken, Transport, UsbTransport};
