// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod device_task;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use astro_app::{init_logging, normalize_name, ConfigFile};
use astro_backend::{register_builtin_backends_on, RegistrationContext};
use astro_core::device::controller::{DeviceListener, TracingListener};
use astro_core::{Adapter, DeviceHandle, DynResult};

use config::{AccessConfig, DeviceConfig, ServerConfig};
use device_task::DeviceTaskConfig;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - astronomical device server");
const SHUTDOWN_GRACE: Duration = Duration::from_millis(400);

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Run a single device on this backend instead of the configured ones
    /// (e.g. sim-eaf, sim-ioptron, ioptron)
    #[arg(short = 'd', long = "device")]
    device: Option<String>,
    /// Serial address for --device: <path> <baud>
    #[arg(value_name = "DEVICE_ADDR")]
    device_addr: Option<String>,
}

/// Parse a serial device address of the form "<path> <baud>".
fn parse_serial_addr(addr: &str) -> DynResult<(String, u32)> {
    let mut parts = addr.split_whitespace();
    let path = parts
        .next()
        .ok_or("Serial device address must be '<path> <baud>'")?;
    let baud_str = parts
        .next()
        .ok_or("Serial device address must be '<path> <baud>'")?;
    if parts.next().is_some() {
        return Err("Serial device address must be '<path> <baud>' (got extra data)".into());
    }
    let baud: u32 = baud_str
        .parse()
        .map_err(|e| format!("Invalid baud '{}': {}", baud_str, e))?;
    Ok((path.to_string(), baud))
}

/// Devices to run: the one named on the command line, or the configured
/// list.
fn resolve_devices(
    cli: &Cli,
    cfg: &ServerConfig,
    registry: &RegistrationContext,
) -> DynResult<Vec<DeviceConfig>> {
    let devices = match &cli.device {
        Some(backend) => {
            let access = match &cli.device_addr {
                Some(addr) => {
                    let (path, baud) = parse_serial_addr(addr)?;
                    AccessConfig {
                        access_type: Some("serial".to_string()),
                        port: Some(path),
                        baud: Some(baud),
                        devices: None,
                    }
                }
                None => AccessConfig::default(),
            };
            vec![DeviceConfig {
                id: normalize_name(backend),
                backend: Some(backend.clone()),
                access,
                ..DeviceConfig::default()
            }]
        }
        None => cfg.resolved_devices(),
    };

    if devices.is_empty() {
        return Err(
            "No devices configured. Use --device or add [[astro-server.devices]] entries to the config."
                .into(),
        );
    }
    for device in &devices {
        if !registry.is_backend_registered(device.backend_name()) {
            return Err(format!(
                "Unknown device backend: {} (available: {})",
                device.backend_name(),
                registry.registered_backends().join(", ")
            )
            .into());
        }
    }
    Ok(devices)
}

/// One adapter per adapter key. Devices sharing a key must name the same
/// backend; their calls are serialized by the adapter.
fn build_adapters(
    devices: &[DeviceConfig],
    cfg: &ServerConfig,
    registry: &RegistrationContext,
) -> DynResult<HashMap<String, Arc<Adapter>>> {
    let mut backends: HashMap<String, String> = HashMap::new();
    let mut adapters: HashMap<String, Arc<Adapter>> = HashMap::new();
    for device in devices {
        let key = device.adapter_key();
        let backend = normalize_name(device.backend_name());
        if let Some(existing) = backends.get(&key) {
            if *existing != backend {
                return Err(format!(
                    "Device '{}' shares adapter '{}' but uses backend {} instead of {}",
                    device.id, key, backend, existing
                )
                .into());
            }
            continue;
        }

        let access = device.access.to_access()?;
        let instance = registry.build_backend(device.backend_name(), access)?;
        let call_timeout = device.effective_behavior(&cfg.behavior).call_timeout();
        info!("Adapter '{}': {} backend", key, instance.kind());
        adapters.insert(
            key.clone(),
            Arc::new(Adapter::new(key.clone(), instance, call_timeout)),
        );
        backends.insert(key, backend);
    }
    Ok(adapters)
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let mut registry = RegistrationContext::new();
    register_builtin_backends_on(&mut registry);

    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_combined_toml());
        return Ok(());
    }

    let (cfg, config_path) = ServerConfig::load(cli.config.as_deref())?;
    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let devices = resolve_devices(&cli, &cfg, &registry)?;
    let adapters = build_adapters(&devices, &cfg, &registry)?;
    info!(
        "Starting astro-server ({} device(s) on {} adapter(s))",
        devices.len(),
        adapters.len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tracing_listener: Arc<dyn DeviceListener> = Arc::new(TracingListener);
    let mut device_handles: Vec<DeviceHandle> = Vec::new();
    let mut task_handles: Vec<JoinHandle<()>> = Vec::new();

    for device in &devices {
        let adapter = adapters
            .get(&device.adapter_key())
            .cloned()
            .ok_or_else(|| format!("No adapter for device '{}'", device.id))?;
        let info = device.device_info(adapter.kind())?;
        let settings = device.device_settings(&cfg.behavior);
        info!(
            "Device '{}': {:?} #{} on adapter '{}'",
            info.id,
            info.kind,
            info.index,
            adapter.name()
        );

        let (engine, handle) = device_task::build_engine(DeviceTaskConfig {
            info,
            settings,
            adapter,
            listeners: vec![tracing_listener.clone()],
        });
        device_handles.push(handle);
        task_handles.push(tokio::spawn(device_task::run_device_task(
            engine,
            shutdown_rx.clone(),
        )));
    }

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    for handle in &task_handles {
        if !handle.is_finished() {
            warn!("Device task still busy after {:?}, aborting", SHUTDOWN_GRACE);
            handle.abort();
        }
    }
    for handle in task_handles {
        let _ = handle.await;
    }
    for handle in &device_handles {
        let snapshot = handle.snapshot();
        info!(
            "[{}] final state {}, {} communication error(s)",
            handle.id(),
            snapshot.connection,
            snapshot.comm_errors
        );
    }
    Ok(())
}
