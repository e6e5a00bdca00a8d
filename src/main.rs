use std::fs::File;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use goodix_rs::{DeviceConfig, Goodix5110, GoodixDevice, ImageDevice, UsbTransport};

/// Bring up a Goodix TLS fingerprint sensor and talk to it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Skip the TLS handshake after activation.
    #[arg(long)]
    no_tls: bool,
    /// Hex-encoded 32-byte PSK, overriding the configuration file.
    #[arg(long)]
    psk: Option<String>,
    /// Per-transfer command timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Activate the sensor and print its firmware version.
    Info,
    /// Activate, then dump the MCU state block.
    McuState,
    /// Activate, then read sensor registers.
    ReadRegister {
        /// Register address, decimal or 0x-prefixed hex.
        #[arg(value_parser = parse_u16)]
        address: u16,
        #[arg(default_value_t = 2)]
        length: u8,
    },
    /// Reset the sensor and MCU without activating.
    Reset {
        #[arg(long, default_value_t = 20)]
        sleep_ms: u8,
    },
}

fn parse_u16(text: &str) -> Result<u16, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {text:?}: {e}"))
}

fn setup_logging(
    log_file_path: Option<PathBuf>,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path)
            .with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v (USB traffic), TRACE with -vv (packets).
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<DeviceConfig> {
    let mut config = match &cli.config {
        Some(path) => DeviceConfig::load(path).with_context(|| format!("Failed to load {:?}", path))?,
        None => DeviceConfig::default(),
    };
    if cli.no_tls {
        config.tls.enabled = false;
    }
    if let Some(psk) = &cli.psk {
        config.tls.psk = Some(psk.clone());
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.protocol.command_timeout_ms = timeout_ms;
    }
    if config.tls.enabled && !cfg!(feature = "openssl") {
        warn!("Built without the `openssl` feature, TLS handshake disabled");
        config.tls.enabled = false;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn connect(config: &DeviceConfig) -> Result<GoodixDevice<UsbTransport, Goodix5110>> {
    let device = GoodixDevice::open_usb(Goodix5110, config).context("Failed to open the sensor")?;
    #[cfg(feature = "openssl")]
    let device = device.with_tls_engine(goodix_rs::tls::openssl::OpensslEngine::new);
    Ok(device)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let mut device = connect(&config)?;

    let cancel = device.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the running operation");
            cancel.cancel();
        }
    });

    device.open().await.context("Failed to open the device")?;

    if let Action::Reset { sleep_ms } = cli.action {
        device.reset(true, true, sleep_ms).await.context("Reset failed")?;
        println!("Sensor reset");
        device.close().await?;
        return Ok(());
    }

    device.activate().await.context("Activation failed")?;
    let firmware = device.firmware_version().unwrap_or("<unknown>");
    println!("Firmware: {}", firmware);
    if let Some(phase) = device.tls_phase() {
        println!("TLS: {}", phase);
    }

    match cli.action {
        Action::McuState => {
            let state = device.query_mcu_state().await.context("MCU state query failed")?;
            println!("MCU state: {}", hex::encode(&state));
        }
        Action::ReadRegister { address, length } => {
            let value = device
                .read_register(address, length)
                .await
                .with_context(|| format!("Reading register {:#06x} failed", address))?;
            println!("Register {:#06x}: {}", address, hex::encode(&value));
        }
        Action::Info | Action::Reset { .. } => {}
    }

    device.deactivate().await?;
    device.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("{:?}", e);
        process::exit(1);
    }

    Ok(())
}
