use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use num_enum::TryFromPrimitive;
use tracing::{debug, info, warn};

use crate::command::{self, Command, Reply};
use crate::config::DeviceConfig;
use crate::constants::{DEVICE_CONFIG, FIRMWARE_VERSION_FIELD_LEN, FIRMWARE_VERSION_SUPPORTED, PID_5110};
use crate::error::{Error, Result};
use crate::psk::Psk;
use crate::sequencer::{Operation, Sequencer, Step};
use crate::tls::{TlsEngine, TlsPhase, TlsTunnel};
use crate::transport::{CancelToken, CommandChannel, Transport, UsbTransport};

/// What the host wants the sensor to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum ImageDeviceState {
    #[default]
    Inactive,
    AwaitFingerOn,
    Capture,
    AwaitFingerOff,
}

/// Lifecycle contract between a host fingerprint framework and a driver.
#[allow(async_fn_in_trait)]
pub trait ImageDevice {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn activate(&mut self) -> Result<()>;
    async fn deactivate(&mut self) -> Result<()>;
    fn change_state(&mut self, state: ImageDeviceState) -> Result<()>;
}

/// Per-model capabilities.
pub trait SensorVariant {
    fn name(&self) -> &'static str;
    fn product_id(&self) -> u16;
    fn supports_tls(&self) -> bool;
    fn supported_firmware(&self) -> &str;
    fn config_blob(&self) -> &'static [u8];

    /// Separate bulk IN endpoint for image data, if the model has one.
    fn image_endpoint(&self) -> Option<u8> {
        None
    }
}

/// The TLS-capable 5110.
#[derive(Debug, Clone, Copy, Default)]
pub struct Goodix5110;

impl SensorVariant for Goodix5110 {
    fn name(&self) -> &'static str {
        "Goodix 5110 Fingerprint Sensor"
    }

    fn product_id(&self) -> u16 {
        PID_5110
    }

    fn supports_tls(&self) -> bool {
        true
    }

    fn supported_firmware(&self) -> &str {
        FIRMWARE_VERSION_SUPPORTED
    }

    fn config_blob(&self) -> &'static [u8] {
        DEVICE_CONFIG
    }
}

/// A sensor that talks the same command protocol in the clear.
#[derive(Debug, Clone)]
pub struct PlainSensor {
    pub product_id: u16,
    pub firmware: String,
    pub image_endpoint: Option<u8>,
}

impl SensorVariant for PlainSensor {
    fn name(&self) -> &'static str {
        "Goodix sensor (no TLS)"
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn supports_tls(&self) -> bool {
        false
    }

    fn supported_firmware(&self) -> &str {
        &self.firmware
    }

    fn config_blob(&self) -> &'static [u8] {
        DEVICE_CONFIG
    }

    fn image_endpoint(&self) -> Option<u8> {
        self.image_endpoint
    }
}

/// Mutable per-device state. Reset at the start of every activation and on
/// close.
#[derive(Debug, Clone)]
pub struct DeviceCommandContext {
    /// Command currently (or last) in flight.
    pub cmd: Option<Command>,
    /// Reply of the most recent read. Replaced, never modified in place.
    pub last_read: Option<Bytes>,
    pub fw_version: Option<String>,
    /// Reference frame for image post-processing.
    pub background: Option<Bytes>,
    pub cmd_timeout: Duration,
    pub active: bool,
    pub deactivating: bool,
    pub state: ImageDeviceState,
    default_timeout: Duration,
}

impl DeviceCommandContext {
    pub fn new(cmd_timeout: Duration) -> Self {
        Self {
            cmd: None,
            last_read: None,
            fw_version: None,
            background: None,
            cmd_timeout,
            active: false,
            deactivating: false,
            state: ImageDeviceState::Inactive,
            default_timeout: cmd_timeout,
        }
    }

    pub fn reset(&mut self) {
        debug!("Resetting device command context");
        self.cmd = None;
        self.last_read = None;
        self.fw_version = None;
        self.cmd_timeout = self.default_timeout;
    }
}

/// Command channel plus the context commands update.
pub struct DeviceCore<T> {
    channel: CommandChannel<T>,
    ctx: DeviceCommandContext,
}

impl<T: Transport> DeviceCore<T> {
    pub async fn run_command(&mut self, cmd: Command) -> Result<Reply> {
        self.ctx.cmd = Some(cmd.clone());
        let reply = cmd.execute(&mut self.channel, self.ctx.cmd_timeout).await?;
        if let Reply::Data(data) | Reply::Record(data) = &reply {
            self.ctx.last_read = Some(data.clone());
        }
        Ok(reply)
    }

    pub fn context(&self) -> &DeviceCommandContext {
        &self.ctx
    }
}

/// Extract the NUL-terminated version string from firmware reply data.
pub fn parse_firmware_version(data: &[u8]) -> String {
    let field = &data[..data.len().min(FIRMWARE_VERSION_FIELD_LEN)];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ActivateState {
    Nop1,
    EnableChip,
    Nop2,
    GetFirmwareVersion,
    VerifyFirmwareVersion,
}

/// Wake the chip and make sure it runs firmware we can talk to.
pub struct Activation<T> {
    supported_firmware: String,
    _transport: PhantomData<fn() -> T>,
}

impl<T> Activation<T> {
    pub fn new(supported_firmware: impl Into<String>) -> Self {
        Self {
            supported_firmware: supported_firmware.into(),
            _transport: PhantomData,
        }
    }
}

impl<T: Transport> Activation<T> {
    async fn get_firmware_version(&mut self, core: &mut DeviceCore<T>) -> Result<()> {
        let data = core.run_command(command::firmware_version()).await?.into_data()?;
        let version = parse_firmware_version(&data);
        info!(firmware = %version, "Firmware version");
        core.ctx.fw_version = Some(version);
        Ok(())
    }

    fn verify_firmware_version(&self, core: &DeviceCore<T>) -> Result<()> {
        let found = core.ctx.fw_version.as_deref().unwrap_or_default();
        if found != self.supported_firmware {
            return Err(Error::UnsupportedFirmware {
                found: found.to_string(),
                expected: self.supported_firmware.clone(),
            });
        }
        Ok(())
    }
}

impl<T: Transport> Operation for Activation<T> {
    type State = ActivateState;
    type Context = DeviceCore<T>;

    const NAME: &'static str = "activate";
    const NUM_STATES: u8 = 5;

    async fn run_state(&mut self, state: ActivateState, core: &mut DeviceCore<T>) -> Step {
        match state {
            // No visible effect, but the vendor driver issues it around enable too.
            ActivateState::Nop1 | ActivateState::Nop2 => core.run_command(command::nop()).await.map(drop).into(),
            ActivateState::EnableChip => core.run_command(command::enable_chip(true)).await.map(drop).into(),
            ActivateState::GetFirmwareVersion => self.get_firmware_version(core).await.into(),
            ActivateState::VerifyFirmwareVersion => match self.verify_firmware_version(core) {
                Ok(()) => Step::Complete,
                Err(err) => Step::Fail(err),
            },
        }
    }
}

type EngineFactory = Box<dyn Fn() -> Box<dyn TlsEngine>>;

/// A Goodix sensor driven over `T`.
pub struct GoodixDevice<T, V> {
    core: DeviceCore<T>,
    variant: V,
    sequencer: Sequencer,
    psk: Psk,
    tls_enabled: bool,
    engine_factory: Option<EngineFactory>,
    tunnel: Option<TlsTunnel<Box<dyn TlsEngine>>>,
    opened: bool,
}

impl<V: SensorVariant> GoodixDevice<UsbTransport, V> {
    /// Find the sensor described by `config`. Its interface is claimed by
    /// [`ImageDevice::open`].
    pub fn open_usb(variant: V, config: &DeviceConfig) -> Result<Self> {
        let transport = UsbTransport::open(config.usb.vendor_id, config.usb.product_id, config.usb.interface)?;
        Self::new(transport, variant, config)
    }
}

impl<T: Transport, V: SensorVariant> GoodixDevice<T, V> {
    pub fn new(transport: T, variant: V, config: &DeviceConfig) -> Result<Self> {
        config.validate()?;
        let channel = CommandChannel::new(transport, config.endpoints(), CancelToken::new())
            .with_max_frame_payload(config.protocol.max_frame_payload);
        Ok(Self {
            core: DeviceCore {
                channel,
                ctx: DeviceCommandContext::new(config.command_timeout()),
            },
            variant,
            sequencer: Sequencer::new(),
            psk: config.psk()?,
            tls_enabled: config.tls.enabled,
            engine_factory: None,
            tunnel: None,
            opened: false,
        })
    }

    /// Engine used for each TLS handshake. A fresh one is built per attempt.
    pub fn with_tls_engine<F, E>(mut self, factory: F) -> Self
    where
        F: Fn() -> E + 'static,
        E: TlsEngine + 'static,
    {
        self.engine_factory = Some(Box::new(move || Box::new(factory()) as Box<dyn TlsEngine>));
        self
    }

    pub fn variant(&self) -> &V {
        &self.variant
    }

    pub fn context(&self) -> &DeviceCommandContext {
        self.core.context()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.core.ctx.fw_version.as_deref()
    }

    /// Token that aborts the in-flight transfer of any running operation.
    pub fn cancel_token(&self) -> CancelToken {
        self.core.channel.cancel_token().clone()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn tls_phase(&self) -> Option<TlsPhase> {
        self.tunnel.as_ref().map(TlsTunnel::phase)
    }

    pub fn transport(&self) -> &T {
        self.core.channel.transport()
    }

    pub fn set_background(&mut self, frame: Bytes) {
        self.core.ctx.background = Some(frame);
    }

    pub fn background(&self) -> Option<&Bytes> {
        self.core.ctx.background.as_ref()
    }

    fn require_open(&self) -> Result<()> {
        if !self.opened {
            return Err(Error::ProtocolState("device is not open".into()));
        }
        Ok(())
    }

    fn require_active(&self) -> Result<()> {
        self.require_open()?;
        if !self.core.ctx.active {
            return Err(Error::ProtocolState("device is not active".into()));
        }
        Ok(())
    }

    /// Run a single command outside any operation.
    pub async fn run_command(&mut self, cmd: Command) -> Result<Reply> {
        self.require_open()?;
        let _guard = self.sequencer.try_begin(cmd.name)?;
        self.core.run_command(cmd).await
    }

    pub async fn reset(&mut self, reset_sensor: bool, soft_reset_mcu: bool, sleep_time_ms: u8) -> Result<()> {
        self.run_command(command::reset(reset_sensor, soft_reset_mcu, sleep_time_ms))
            .await?;
        self.core.channel.discard_input();
        Ok(())
    }

    pub async fn query_mcu_state(&mut self) -> Result<Bytes> {
        self.run_command(command::query_mcu_state()).await?.into_data()
    }

    pub async fn upload_config(&mut self) -> Result<()> {
        let blob = self.variant.config_blob();
        self.run_command(command::upload_config_mcu(blob)).await?;
        Ok(())
    }

    pub async fn set_powerdown_scan_frequency(&mut self, frequency: u16) -> Result<()> {
        self.run_command(command::set_powerdown_scan_frequency(frequency))
            .await?;
        Ok(())
    }

    pub async fn read_register(&mut self, address: u16, length: u8) -> Result<Bytes> {
        self.run_command(command::read_sensor_register(address, length))
            .await?
            .into_data()
    }

    pub async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.run_command(command::write_sensor_register(address, value))
            .await?;
        Ok(())
    }

    pub async fn switch_to_idle_mode(&mut self, sleep_time: u8) -> Result<()> {
        self.run_command(command::switch_to_idle_mode(sleep_time)).await?;
        Ok(())
    }

    pub async fn switch_to_fdt_mode(&mut self, mode: Bytes) -> Result<()> {
        self.run_command(command::switch_to_fdt_mode(mode)).await?;
        Ok(())
    }

    /// Fetch one raw image, decrypting it when the tunnel is up.
    pub async fn capture_image(&mut self) -> Result<Bytes> {
        self.require_active()?;
        let encrypted = self.tunnel.is_some();
        let mut cmd = command::mcu_get_image(encrypted);
        if let (false, Some(endpoint)) = (encrypted, self.variant.image_endpoint()) {
            cmd = cmd.with_data_endpoint(endpoint);
        }
        let raw = self.run_command(cmd).await?.into_data()?;
        match self.tunnel.as_mut() {
            Some(tunnel) => tunnel.open_record(&raw),
            None => Ok(raw),
        }
    }

    async fn establish_tls(&mut self) -> Result<()> {
        let factory = self
            .engine_factory
            .as_ref()
            .ok_or_else(|| Error::Config(format!("{} needs a TLS engine", self.variant.name())))?;
        let tunnel = self.tunnel.insert(TlsTunnel::new(factory(), self.psk.clone()));
        let cancel = self.core.channel.cancel_token().clone();
        let timeout = self.core.ctx.cmd_timeout;
        let result = tunnel
            .establish(&self.sequencer, &mut self.core.channel, &cancel, timeout)
            .await;
        if result.is_err() {
            self.tunnel = None;
        }
        result
    }
}

impl<T: Transport, V: SensorVariant> ImageDevice for GoodixDevice<T, V> {
    async fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(Error::ProtocolState("device is already open".into()));
        }
        info!(sensor = self.variant.name(), "Opening device");
        self.core.channel.transport_mut().claim().await?;
        self.core.ctx.reset();
        self.core.channel.discard_input();
        self.opened = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.require_open()?;
        if self.core.ctx.active {
            self.deactivate().await?;
        }
        info!(sensor = self.variant.name(), "Closing device");
        self.core.ctx.reset();
        self.core.ctx.background = None;
        self.core.channel.discard_input();
        self.opened = false;
        self.core.channel.transport_mut().release().await
    }

    async fn activate(&mut self) -> Result<()> {
        self.require_open()?;
        if self.core.ctx.active {
            return Err(Error::ProtocolState("device is already active".into()));
        }
        self.core.ctx.reset();

        let mut activation = Activation::<T>::new(self.variant.supported_firmware());
        let cancel = self.core.channel.cancel_token().clone();
        let mut result = self.sequencer.execute(&mut activation, &mut self.core, &cancel).await;

        if result.is_ok() && self.variant.supports_tls() && self.tls_enabled {
            result = self.establish_tls().await;
        }

        match result {
            Ok(()) => {
                self.core.ctx.active = true;
                info!(sensor = self.variant.name(), "Device activated");
                Ok(())
            }
            Err(err) => {
                self.core.ctx.reset();
                self.core.channel.discard_input();
                Err(err)
            }
        }
    }

    async fn deactivate(&mut self) -> Result<()> {
        self.require_open()?;
        if !self.core.ctx.active {
            debug!("Device already inactive");
            return Ok(());
        }
        self.core.ctx.deactivating = true;
        if self.tunnel.take().is_some() {
            debug!("TLS session discarded");
        }
        self.core.ctx.active = false;
        self.core.ctx.deactivating = false;
        self.core.ctx.state = ImageDeviceState::Inactive;
        info!(sensor = self.variant.name(), "Device deactivated");
        Ok(())
    }

    fn change_state(&mut self, state: ImageDeviceState) -> Result<()> {
        self.require_open()?;
        if !self.core.ctx.active && state != ImageDeviceState::Inactive {
            warn!(%state, "State change requested on an inactive device");
            return Err(Error::ProtocolState(format!("cannot enter {state} while inactive")));
        }
        debug!(from = %self.core.ctx.state, to = %state, "Image device state");
        self.core.ctx.state = state;
        Ok(())
    }
}
