//! Dump the sensor's USB descriptors and check the command endpoints the
//! driver expects are present.

use anyhow::{Context, Result, bail};
use clap::Parser;
use nusb::transfer::EndpointType;
use tracing::{info, warn};

use goodix_rs::constants::{
    ENDPOINT_IN, ENDPOINT_OUT, EP_IN_MAX_PACKET_SIZE, EP_OUT_MAX_BUF_SIZE, INTERFACE, PID_5110, VID,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Vendor ID in hex. Defaults to Goodix.
    #[arg(long, value_parser = parse_id)]
    vid: Option<u16>,
    /// Product ID in hex. Defaults to the 5110.
    #[arg(long, value_parser = parse_id)]
    pid: Option<u16>,
}

fn parse_id(text: &str) -> Result<u16, String> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid USB id {text:?}: {e}"))
}

fn transfer_type(ty: EndpointType) -> &'static str {
    match ty {
        EndpointType::Control => "Control",
        EndpointType::Isochronous => "Isochronous",
        EndpointType::Bulk => "Bulk",
        EndpointType::Interrupt => "Interrupt",
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().without_time().with_target(false).init();
    let cli = Cli::parse();
    let vid = cli.vid.unwrap_or(VID);
    let pid = cli.pid.unwrap_or(PID_5110);

    info!("Searching for Goodix sensor (VID: {:#06x}, PID: {:#06x})...", vid, pid);
    let Some(device_info) = nusb::list_devices()?.find(|d| d.vendor_id() == vid && d.product_id() == pid) else {
        bail!("no device {:04x}:{:04x} found", vid, pid);
    };

    info!(
        "Found on bus {:03} address {:03}, speed {:?}",
        device_info.bus_number(),
        device_info.device_address(),
        device_info.speed()
    );
    if let Some(product) = device_info.product_string() {
        info!("  Product: {}", product);
    }
    if let Some(serial) = device_info.serial_number() {
        info!("  Serial: {}", serial);
    }

    let device = device_info
        .open()
        .context("Failed to open the sensor. Check permissions (udev rules on Linux).")?;
    let config = device.active_configuration()?;
    info!("Configuration {}", config.configuration_value());

    let mut found_out = false;
    let mut found_in = false;
    for interface in config.interfaces() {
        for setting in interface.alt_settings() {
            info!(
                "  Interface {} alt {}: class {:#04x}/{:#04x}/{:#04x}",
                setting.interface_number(),
                setting.alternate_setting(),
                setting.class(),
                setting.subclass(),
                setting.protocol()
            );
            for endpoint in setting.endpoints() {
                let address = endpoint.address();
                info!(
                    "    Endpoint {:#04x} {} max packet {}",
                    address,
                    transfer_type(endpoint.transfer_type()),
                    endpoint.max_packet_size()
                );

                if setting.interface_number() != INTERFACE || endpoint.transfer_type() != EndpointType::Bulk {
                    continue;
                }
                if address == ENDPOINT_OUT {
                    found_out = true;
                    if endpoint.max_packet_size() != EP_OUT_MAX_BUF_SIZE {
                        warn!(
                            "OUT endpoint max packet size is {}, frames are sized for {}",
                            endpoint.max_packet_size(),
                            EP_OUT_MAX_BUF_SIZE
                        );
                    }
                }
                if address == ENDPOINT_IN {
                    found_in = true;
                    if endpoint.max_packet_size() != EP_IN_MAX_PACKET_SIZE {
                        warn!(
                            "IN endpoint max packet size is {}, reads are rounded to {}",
                            endpoint.max_packet_size(),
                            EP_IN_MAX_PACKET_SIZE
                        );
                    }
                }
            }
        }
    }

    if !(found_out && found_in) {
        bail!(
            "interface {} lacks bulk endpoints {:#04x}/{:#04x}",
            INTERFACE,
            ENDPOINT_OUT,
            ENDPOINT_IN
        );
    }
    info!("Command endpoints present.");
    Ok(())
}
