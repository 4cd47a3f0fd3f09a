//! Franklin Device Server
//!
//! Finds Franklin devices on serial ports, starts a worker for each of them
//! and keeps ports, workers and sessions in step while devices come and go.

mod settings;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use franklin_detect::{is_synthetic_port, PortScanner};
use franklin_mux::{spawn_coordinator, storage, CoordinatorHandle, Role, Session};
use franklin_protocol::DeviceId;
use settings::Settings;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "franklin")]
#[command(version = VERSION)]
#[command(about = "Device server for Franklin printers and CNC machines")]
struct Cli {
    /// Settings file (default: $XDG_CONFIG_HOME/franklin/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Detect devices on new ports and after disconnects
    #[arg(long, conflicts_with = "no_autodetect")]
    autodetect: bool,
    /// Leave new ports alone until detection is requested
    #[arg(long)]
    no_autodetect: bool,
    /// Command run before detection; #PORT# is replaced
    #[arg(long)]
    predetect: Option<String>,
    /// Policy for system commands run by jobs
    #[arg(long)]
    allow_system: Option<String>,
    /// Serve a local device through the synthetic port `-`
    #[arg(long)]
    local: Option<String>,
    /// Worker program
    #[arg(long)]
    driver: Option<String>,
    /// Directory holding persisted devices
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Printer new sessions start bound to
    #[arg(long)]
    default_printer: Option<DeviceId>,
    /// Extra port blacklist pattern (repeatable)
    #[arg(long)]
    add_blacklist: Vec<String>,
    /// Hot-plug polling period in milliseconds, 0 to disable
    #[arg(long)]
    scan_interval_ms: Option<u64>,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if self.autodetect {
            settings.autodetect = true;
        }
        if self.no_autodetect {
            settings.autodetect = false;
        }
        if let Some(predetect) = self.predetect {
            settings.predetect = predetect;
        }
        if let Some(allow_system) = self.allow_system {
            settings.allow_system = allow_system;
        }
        if let Some(local) = self.local {
            settings.local = local;
        }
        if let Some(driver) = self.driver {
            settings.driver = driver;
        }
        if let Some(data_dir) = self.data_dir {
            settings.data_dir = Some(data_dir);
        }
        if let Some(uuid) = self.default_printer {
            settings.default_printer = Some(uuid);
        }
        settings.add_blacklist.extend(self.add_blacklist);
        if let Some(ms) = self.scan_interval_ms {
            settings.scan_interval_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "franklin=info,franklin_protocol=info,franklin_detect=info,franklin_mux=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };
    cli.apply(&mut settings);

    info!("Starting Franklin server {}", VERSION);
    let config = settings.coordinator_config()?;
    let (handle, coordinator) = spawn_coordinator(config, settings.backend().into_backend());

    let monitor = handle
        .open_session(Role::Admin)
        .await
        .context("Failed to open monitor session")?;
    monitor.set_monitor(true).await?;
    tokio::spawn(log_events(monitor));

    boot(&handle, &settings).await;
    let scanner = settings
        .scan_interval()
        .map(|period| tokio::spawn(poll_ports(handle.clone(), period)));

    info!("Franklin server is running");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to wait for ctrl-c: {}", e);
            }
            info!("Shutting down");
        }
        _ = handle.closed() => warn!("Coordinator stopped unexpectedly"),
    }

    if let Some(scanner) = scanner {
        scanner.abort();
    }
    handle.shutdown();
    coordinator.await.context("Coordinator task failed")?;
    Ok(())
}

/// Start persisted devices, the local device and every port present now
async fn boot(handle: &CoordinatorHandle, settings: &Settings) {
    if let Some(dir) = &settings.data_dir {
        for uuid in storage::persisted_devices(dir) {
            info!("Starting printer {}", uuid);
            if let Err(e) = handle.create_printer(Some(uuid)).await {
                warn!("Failed to start printer {}: {}", uuid, e);
            }
        }
    }

    if !settings.local.is_empty() {
        if let Err(e) = handle.add_port("-") {
            warn!("Failed to add local port: {}", e);
        }
    }

    match tokio::task::spawn_blocking(|| PortScanner::new().enumerate_ports()).await {
        Ok(Ok(ports)) => {
            for port in ports {
                let _ = handle.add_port(port);
            }
        }
        Ok(Err(e)) => warn!("Not probing serial ports: {}", e),
        Err(e) => error!("Port enumeration panicked: {}", e),
    }
}

/// Add ports that appeared and remove real ports that vanished since the
/// previous scan
async fn poll_ports(handle: CoordinatorHandle, period: Duration) {
    let mut known: BTreeSet<String> = BTreeSet::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let ports = match tokio::task::spawn_blocking(|| PortScanner::new().enumerate_ports()).await {
            Ok(Ok(ports)) => ports,
            Ok(Err(e)) => {
                debug!("Port scan failed: {}", e);
                continue;
            }
            Err(e) => {
                error!("Port scan panicked: {}", e);
                return;
            }
        };
        let current: BTreeSet<String> = ports.into_iter().collect();

        for port in current.difference(&known) {
            if handle.add_port(port.as_str()).is_err() {
                return;
            }
        }
        for port in known.difference(&current) {
            if is_synthetic_port(port) {
                continue;
            }
            debug!("Port {} vanished", port);
            if handle.remove_port(port.as_str()).is_err() {
                return;
            }
        }
        known = current;
    }
}

/// Log every event seen by the monitor session
async fn log_events(mut session: Session) {
    while let Some(event) = session.next_event().await {
        info!("{} {}", event.name(), serde_json::Value::Array(event.args()));
    }
    debug!("Monitor session ended");
}
