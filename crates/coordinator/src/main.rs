//! usb-coordinator
//!
//! Runs the cross-context device-session coordinator. Without a real device
//! layer it drives a page, a dedicated worker and two shared worker ports
//! against in-memory loopback devices and logs everything they observe.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use coordinator::Coordinator;
use coordinator::backend::LoopbackBackend;
use coordinator::config::CoordinatorConfig;
use protocol::{
    ConfigurationDescriptor, DeviceIdentity, HostDeviceReport, HostKey, InterfaceDescriptor,
    SessionKind, TransferRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-coordinator")]
#[command(
    author,
    version,
    about = "USB session coordinator - share devices between a page and its workers"
)]
#[command(long_about = "
Coordinates access to USB devices from several execution contexts of one
origin: exclusive open, exclusive interface claims, ordered transfers and
state-change events.

EXAMPLES:
    # Run the loopback demo with default config
    usb-coordinator

    # Run with custom config
    usb-coordinator --config /path/to/coordinator.toml

    # List host USB devices (requires the rusb feature)
    usb-coordinator --list-devices

    # Run with debug logging
    usb-coordinator --log-level debug

CONFIGURATION:
    The coordinator looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-coordinator/coordinator.toml
    3. /etc/usb-coordinator/coordinator.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List host USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = CoordinatorConfig::default();
        let path = CoordinatorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        CoordinatorConfig::load_from(path).context("Failed to load configuration")?
    } else {
        CoordinatorConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.coordinator.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-coordinator v{}", env!("CARGO_PKG_VERSION"));
    info!("Origin: {}", config.coordinator.origin);

    if args.list_devices {
        return list_devices_mode();
    }

    run_demo(config).await
}

/// List host USB devices and exit
#[cfg(feature = "rusb")]
fn list_devices_mode() -> Result<()> {
    let backend =
        coordinator::backend::RusbBackend::new().context("Failed to initialize libusb")?;
    let reports = backend
        .enumerate()
        .map_err(|e| anyhow!("Failed to enumerate devices: {}", e))?;

    if reports.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", reports.len());
    for report in reports {
        println!(
            "  {} - {} {}",
            report.identity,
            report
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            report.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Bus {:03} Device {:03} Class: {} Configurations: {}",
            report.host_key.bus,
            report.host_key.address,
            report.class,
            report.configurations.len()
        );
        println!();
    }
    Ok(())
}

#[cfg(not(feature = "rusb"))]
fn list_devices_mode() -> Result<()> {
    Err(anyhow!(
        "--list-devices needs a build with the `rusb` feature"
    ))
}

fn demo_report(address: u8, serial: &str) -> HostDeviceReport {
    HostDeviceReport {
        host_key: HostKey { bus: 1, address },
        identity: DeviceIdentity::new(0x1209, 0x0001, Some(serial)),
        class: 0xff,
        manufacturer: Some("Loopback".to_string()),
        product: Some("Echo device".to_string()),
        configurations: vec![ConfigurationDescriptor {
            value: 1,
            interfaces: vec![
                InterfaceDescriptor {
                    number: 0,
                    endpoints: vec![0x81, 0x01],
                },
                InterfaceDescriptor {
                    number: 1,
                    endpoints: vec![0x82, 0x02],
                },
            ],
            raw: Vec::new(),
        }],
    }
}

fn bulk(endpoint: u8, data: Vec<u8>) -> TransferRequest {
    TransferRequest::Bulk {
        endpoint,
        data,
        timeout_ms: 1000,
    }
}

/// Page, dedicated worker and shared worker ports against loopback devices
async fn run_demo(config: CoordinatorConfig) -> Result<()> {
    info!(
        "Running loopback demo (shared worker ports: {:?})",
        config.sessions.shared_worker_ports
    );

    let backend = LoopbackBackend::new();
    let coordinator = Coordinator::new(&config, Arc::new(backend.clone()));

    let page = coordinator.create_session(SessionKind::Window);
    let worker = coordinator.create_session(SessionKind::DedicatedWorker);

    let mut worker_events = worker.events()?;
    let event_log = tokio::spawn(async move {
        while let Some(event) = worker_events.next().await {
            info!("Worker observed: {:?}", event);
        }
    });

    // Host reports two devices; only the granted one is surfaced
    let echo = demo_report(4, "ECHO0001");
    let other = demo_report(5, "ECHO0002");
    coordinator.registry().on_host_connect(echo.clone());
    coordinator.registry().on_host_connect(other);

    if let Err(e) = worker.grant_access(echo.identity.clone()) {
        warn!("Worker grant refused as expected: {}", e);
    }
    page.grant_access(echo.identity.clone())?;

    let device = worker
        .devices()?
        .first()
        .map(|device| device.id)
        .ok_or_else(|| anyhow!("granted device not visible to worker"))?;

    let handle = worker.open(device)?;
    match page.open(device) {
        Err(e) => info!("Page open refused: {}", e),
        Ok(_) => error!("Page opened a device the worker holds"),
    }
    worker.claim_interface(handle, 0)?;

    // Ordered transfers through the single device channel
    let mut pending = Vec::new();
    for i in 0..4u8 {
        pending.push(worker.transfer(handle, bulk(0x01, vec![i; 4]))?);
    }
    pending.push(worker.transfer(handle, bulk(0x81, vec![0; 16]))?);
    for transfer in pending {
        let ticket = transfer.ticket();
        match transfer.await {
            Ok(done) => info!("Transfer seq {} completed: {:?}", ticket.sequence, done.data),
            Err(e) => error!("Transfer seq {} failed: {}", ticket.sequence, e),
        }
    }

    // Shared worker ports, independent or coalesced per configuration
    let port_a = coordinator.connect_shared_worker_port("sync");
    let port_b = coordinator.connect_shared_worker_port("sync");
    info!(
        "Shared worker ports: session {} flow {}, session {} flow {}",
        port_a.id().0,
        port_a.flow().0,
        port_b.id().0,
        port_b.flow().0
    );

    // Unplugging flushes whatever is still queued
    backend.hold();
    let stuck = worker.transfer(handle, bulk(0x81, vec![0; 8]))?;
    coordinator.registry().on_host_disconnect(echo.host_key);
    backend.release();
    match stuck.await {
        Err(e) => info!("Transfer after unplug: {}", e),
        Ok(_) => warn!("Transfer completed after unplug"),
    }

    coordinator.registry().on_host_connect(echo);
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(port_a);
    drop(port_b);
    worker.terminate();
    page.terminate();
    let _ = event_log.await;

    info!(
        "Demo complete, {} sessions live",
        coordinator.live_sessions().len()
    );
    Ok(())
}
