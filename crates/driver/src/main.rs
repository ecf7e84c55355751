//! usb-modem-driver
//!
//! Host-side driver for a USB-attached cellular modem. Enumerates the
//! modem, runs its MUX data path and power management on a dedicated worker
//! thread, and reports link and power events.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{DriverBridge, DriverCommand, DriverEvent, create_driver_bridge, setup_logging};
use driver::config::DriverConfig;
use driver::usb::list_devices;
use driver::worker::{WorkerSettings, spawn_driver_worker};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-modem-driver")]
#[command(author, version, about = "Host-side driver for USB-attached modems")]
#[command(long_about = "
Drives a USB-attached cellular modem: enumerates the device, resets its
pipes, runs the MUX framing data path and handles power transitions.

EXAMPLES:
    # Run with default config
    usb-modem-driver

    # Run with custom config
    usb-modem-driver --config /path/to/driver.toml

    # List USB devices and exit
    usb-modem-driver --list-devices

    # Drive a specific device and attach a client immediately
    usb-modem-driver --vid 0x05c6 --pid 0x9025 --open

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-modem-driver/driver.toml
    3. /etc/usb-modem-driver/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Vendor ID override (e.g. 0x05c6)
    #[arg(long, value_name = "VID")]
    vid: Option<String>,

    /// Product ID override (e.g. 0x9025)
    #[arg(long, value_name = "PID")]
    pid: Option<String>,

    /// Attach a client once the device has started
    #[arg(long)]
    open: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        DriverConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };
    if let Some(vid) = args.vid {
        config.device.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.device.product_id = pid;
    }
    config.validate()?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-modem-driver v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode();
    }

    let settings = WorkerSettings {
        vendor_id: config.vendor_id()?,
        product_id: config.product_id()?,
        session: config.session_options(),
        store_path: config.store.resolved_path(),
    };
    info!(
        "Driving {:04x}:{:04x} as {}",
        settings.vendor_id, settings.product_id, config.driver.port_name
    );

    let (bridge, worker) = create_driver_bridge();
    let worker_handle =
        spawn_driver_worker(worker, settings).context("Failed to spawn driver worker")?;

    let result = run(bridge.clone(), args.open).await;

    info!("Shutting down driver worker...");
    if let Err(e) = bridge.send_command(DriverCommand::Shutdown).await {
        error!("Error shutting down driver worker: {}", e);
    }

    match worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Driver worker failed: {}", e),
        Err(e) => error!("Driver worker thread panicked: {:?}", e),
    }

    result
}

/// List USB devices and exit
fn list_devices_mode() -> Result<()> {
    let context = rusb::Context::new().context("Failed to create USB context")?;
    let devices = list_devices(&context).map_err(|e| anyhow!("Failed to list devices: {}", e))?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03} Speed: {:?}",
            device.vendor_id, device.product_id, device.bus_number, device.address, device.speed
        );
    }
    Ok(())
}

async fn open_client(bridge: &DriverBridge) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(DriverCommand::Open { response: tx })
        .await
        .context("Failed to send Open command")?;
    rx.await
        .context("Driver worker dropped the Open reply")?
        .context("Open failed")?;
    info!("Client attached");
    Ok(())
}

/// Log driver events until Ctrl+C
async fn run(bridge: DriverBridge, open: bool) -> Result<()> {
    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            event = bridge.recv_event() => {
                let event = event.context("Driver worker stopped")?;
                match event {
                    DriverEvent::DeviceStarted { vendor_id, product_id, model } => {
                        info!("Device {:04x}:{:04x} started ({:?})", vendor_id, product_id, model);
                        if open {
                            if let Err(e) = open_client(&bridge).await {
                                warn!("{:#}", e);
                            }
                        }
                    }
                    DriverEvent::DeviceRemoved => info!("Device removed"),
                    DriverEvent::LinkDown => warn!("Modem link down"),
                    DriverEvent::Deregistered => info!("Deregistered ahead of sleep"),
                    DriverEvent::FlowControl(command) => info!("Flow control: {:?}", command),
                    DriverEvent::PowerStateChanged(level) => info!("Device power now {:?}", level),
                    DriverEvent::Received(payload) => {
                        tracing::debug!("Received {} bytes", payload.len());
                    }
                }
            }
        }
    }
}
