// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for astro-server.
//!
//! Config is loaded from the `[astro-server]` section of `astro-rs.toml`.
//! Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `$ASTRO_RS_CONFIG`
//! 3. `./astro-rs.toml`
//! 4. `~/.config/astro-rs/astro-rs.toml`
//! 5. `/etc/astro-rs/astro-rs.toml`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use astro_app::{normalize_name, ConfigFile};
use astro_backend::BackendAccess;
use astro_core::device::controller::{
    AdaptivePolling, ExponentialBackoff, FixedDelay, FixedPolling, NoPolling, NoRetry,
    OpenStreak, PollingPolicy, ReopenPolicy,
};
use astro_core::{BackendKind, DeviceInfo, DeviceKind, DeviceSettings};

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Polling, retry and timing defaults for every device
    pub behavior: BehaviorConfig,
    /// Controlled devices, one `[[devices]]` entry each.
    #[serde(rename = "devices", default)]
    pub devices: Vec<DeviceConfig>,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollingMode {
    /// Faster while the device moves
    #[default]
    Adaptive,
    Fixed,
    /// Only poll when a command asks for it
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    #[default]
    Backoff,
    Fixed,
    /// Give up after the first failed open
    None,
}

/// Behavior configuration for polling, reopening and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Status poll interval in milliseconds when idle
    pub poll_interval_ms: u64,
    /// Status poll interval in milliseconds while moving
    pub poll_interval_active_ms: u64,
    pub polling: PollingMode,
    pub retry: RetryMode,
    /// Reopen attempts before the device is reported degraded
    pub max_retries: u32,
    /// Base delay between reopen attempts in milliseconds
    pub retry_base_delay_ms: u64,
    /// Upper bound for the backoff delay in milliseconds
    pub retry_max_delay_ms: u64,
    /// Budget for one command exchange in milliseconds
    pub command_timeout_ms: u64,
    /// Budget for a single backend call in milliseconds
    pub call_timeout_ms: u64,
    /// Reply poll interval while a command waits for its answer
    pub reply_poll_ms: u64,
    /// Moves closer than this never reach the device
    pub position_tolerance: f64,
    pub temperature_interval_ms: u64,
    /// Temperature samples kept in the snapshot history
    pub temperature_log_len: usize,
    pub queue_capacity: usize,
    /// Drop the connection after this many consecutive timeouts
    pub timeout_escalation: Option<u32>,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            poll_interval_active_ms: 250,
            polling: PollingMode::Adaptive,
            retry: RetryMode::Backoff,
            max_retries: 5,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 8000,
            command_timeout_ms: 2000,
            call_timeout_ms: 1000,
            reply_poll_ms: 25,
            position_tolerance: 0.1,
            temperature_interval_ms: 15_000,
            temperature_log_len: 32,
            queue_capacity: 16,
            timeout_escalation: None,
        }
    }
}

impl BehaviorConfig {
    fn validate(&self, section: &str) -> Result<(), String> {
        let positive = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("poll_interval_active_ms", self.poll_interval_active_ms),
            ("retry_base_delay_ms", self.retry_base_delay_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("reply_poll_ms", self.reply_poll_ms),
            ("temperature_interval_ms", self.temperature_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(format!("{}.{} must be > 0", section, field));
            }
        }
        if self.retry != RetryMode::None && self.max_retries == 0 {
            return Err(format!("{}.max_retries must be > 0", section));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(format!(
                "{}.retry_max_delay_ms must be >= retry_base_delay_ms",
                section
            ));
        }
        if !self.position_tolerance.is_finite() || self.position_tolerance < 0.0 {
            return Err(format!("{}.position_tolerance must be >= 0", section));
        }
        if self.queue_capacity == 0 {
            return Err(format!("{}.queue_capacity must be > 0", section));
        }
        if self.timeout_escalation == Some(0) {
            return Err(format!("{}.timeout_escalation must be > 0 when set", section));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn polling_policy(&self) -> Arc<dyn PollingPolicy> {
        let idle = Duration::from_millis(self.poll_interval_ms);
        match self.polling {
            PollingMode::Adaptive => Arc::new(AdaptivePolling::new(
                idle,
                Duration::from_millis(self.poll_interval_active_ms),
            )),
            PollingMode::Fixed => Arc::new(FixedPolling::new(idle)),
            PollingMode::None => Arc::new(NoPolling),
        }
    }

    pub fn retry_policy(&self) -> Arc<dyn ReopenPolicy> {
        let base = Duration::from_millis(self.retry_base_delay_ms);
        match self.retry {
            RetryMode::Backoff => Arc::new(ExponentialBackoff::new(
                self.max_retries,
                base,
                Duration::from_millis(self.retry_max_delay_ms),
            )),
            RetryMode::Fixed => Arc::new(FixedDelay::new(self.max_retries, base)),
            RetryMode::None => Arc::new(NoRetry),
        }
    }
}

/// Access method configuration for reaching a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Access type: "sdk", "serial" or "simulated"
    #[serde(rename = "type")]
    pub access_type: Option<String>,
    /// Serial port path (for serial access)
    pub port: Option<String>,
    /// Baud rate (for serial access)
    pub baud: Option<u32>,
    /// Number of simulated units behind one SDK
    pub devices: Option<usize>,
}

impl AccessConfig {
    pub fn to_access(&self) -> Result<BackendAccess, String> {
        match self.access_type.as_deref() {
            Some("sdk") | None => Ok(BackendAccess::Sdk),
            Some("serial") => match (&self.port, self.baud) {
                (Some(path), Some(baud)) if !path.trim().is_empty() && baud > 0 => {
                    Ok(BackendAccess::Serial {
                        path: path.clone(),
                        baud,
                    })
                }
                _ => Err("serial access requires port and baud".to_string()),
            },
            Some("simulated") => Ok(BackendAccess::Simulated {
                devices: self.devices.unwrap_or(1).max(1),
            }),
            Some(other) => Err(format!("unknown access type: {}", other)),
        }
    }
}

/// One controlled device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable device identifier. Generated from the backend when empty.
    pub id: String,
    /// Display name. Defaults to the id.
    pub name: Option<String>,
    /// Expected device kind; checked against the backend at startup.
    pub kind: Option<DeviceKind>,
    /// Registered backend name (e.g. "sim-eaf", "ioptron")
    pub backend: Option<String>,
    /// Devices naming the same adapter share one backend instance.
    pub adapter: Option<String>,
    /// Position in the backend's enumeration list
    pub index: usize,
    pub access: AccessConfig,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub min_position: Option<f64>,
    pub max_position: Option<f64>,
    /// Replaces `[behavior]` for this device
    pub behavior: Option<BehaviorConfig>,
}

impl DeviceConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.as_deref().unwrap_or("")
    }

    /// Key of the adapter this device runs on. Without an explicit name,
    /// devices on the same backend and port share one.
    pub fn adapter_key(&self) -> String {
        if let Some(name) = self.adapter.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        let backend = normalize_name(self.backend_name());
        match &self.access.port {
            Some(port) => format!("{}@{}", backend, port),
            None => backend,
        }
    }

    pub fn effective_behavior<'a>(&'a self, defaults: &'a BehaviorConfig) -> &'a BehaviorConfig {
        self.behavior.as_ref().unwrap_or(defaults)
    }

    /// Static identity for a device driven by `backend`.
    pub fn device_info(&self, backend: BackendKind) -> Result<DeviceInfo, String> {
        let mut info = DeviceInfo::new(self.id.clone(), backend, self.index);
        if let Some(kind) = self.kind {
            if kind != info.kind {
                return Err(format!(
                    "device '{}' is configured as {:?} but backend {} drives a {:?}",
                    self.id, kind, backend, info.kind
                ));
            }
        }
        info.name = self.display_name().to_string();
        if let Some(manufacturer) = &self.manufacturer {
            info.manufacturer = manufacturer.clone();
        }
        if let Some(model) = &self.model {
            info.model = model.clone();
        }
        Ok(info)
    }

    pub fn device_settings(&self, defaults: &BehaviorConfig) -> DeviceSettings {
        let b = self.effective_behavior(defaults);
        DeviceSettings {
            temperature_interval: Duration::from_millis(b.temperature_interval_ms),
            command_timeout: Duration::from_millis(b.command_timeout_ms),
            reply_poll: Duration::from_millis(b.reply_poll_ms),
            position_tolerance: b.position_tolerance,
            min_position: self.min_position,
            max_position: self.max_position,
            queue_capacity: b.queue_capacity,
            temperature_log_len: b.temperature_log_len,
            timeout_escalation: b.timeout_escalation,
            polling: b.polling_policy(),
            reopen: b.retry_policy(),
        }
    }
}

impl ServerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;
        self.behavior.validate("[behavior]")?;

        let mut seen = HashSet::new();
        for device in self.resolved_devices() {
            let section = format!("[[devices]] '{}'", device.id);
            if device.backend_name().trim().is_empty() {
                return Err(format!("{}: backend must be set", section));
            }
            if !seen.insert(device.id.clone()) {
                return Err(format!("{}: duplicate device id", section));
            }
            device
                .access
                .to_access()
                .map_err(|e| format!("{}: {}", section, e))?;
            if let (Some(min), Some(max)) = (device.min_position, device.max_position) {
                if min >= max {
                    return Err(format!(
                        "{}: min_position must be below max_position",
                        section
                    ));
                }
            }
            if let Some(behavior) = &device.behavior {
                behavior.validate(&format!("{} behavior", section))?;
            }
        }
        Ok(())
    }

    /// Devices with generated ids filled in.
    pub fn resolved_devices(&self) -> Vec<DeviceConfig> {
        self.devices
            .iter()
            .enumerate()
            .map(|(idx, device)| {
                let id = if device.id.trim().is_empty() {
                    let backend = device.backend.as_deref().unwrap_or("unknown").to_lowercase();
                    format!("{}_{}", backend, idx)
                } else {
                    device.id.clone()
                };
                DeviceConfig {
                    id,
                    ..device.clone()
                }
            })
            .collect()
    }

    /// Generate an example configuration wrapped in the `[astro-server]`
    /// section, suitable for appending to `astro-rs.toml`.
    pub fn example_combined_toml() -> String {
        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(rename = "astro-server")]
            inner: ServerConfig,
        }
        let example = ServerConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
            },
            behavior: BehaviorConfig::default(),
            devices: vec![
                DeviceConfig {
                    id: "focuser".to_string(),
                    name: Some("Main focuser".to_string()),
                    kind: Some(DeviceKind::Focuser),
                    backend: Some("sim-eaf".to_string()),
                    access: AccessConfig {
                        access_type: Some("simulated".to_string()),
                        devices: Some(1),
                        ..AccessConfig::default()
                    },
                    max_position: Some(10_000.0),
                    ..DeviceConfig::default()
                },
                DeviceConfig {
                    id: "rotator".to_string(),
                    kind: Some(DeviceKind::Rotator),
                    backend: Some("sim-caa".to_string()),
                    ..DeviceConfig::default()
                },
                DeviceConfig {
                    id: "mount".to_string(),
                    name: Some("CEM70".to_string()),
                    kind: Some(DeviceKind::Telescope),
                    backend: Some("ioptron".to_string()),
                    access: AccessConfig {
                        access_type: Some("serial".to_string()),
                        port: Some("/dev/ttyUSB0".to_string()),
                        baud: Some(115_200),
                        devices: None,
                    },
                    behavior: Some(BehaviorConfig {
                        command_timeout_ms: 3000,
                        timeout_escalation: Some(3),
                        ..BehaviorConfig::default()
                    }),
                    ..DeviceConfig::default()
                },
            ],
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    if let Some(level) = level {
        match level {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
                    level
                ))
            }
        }
    }
    Ok(())
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        "astro-server"
    }
}
