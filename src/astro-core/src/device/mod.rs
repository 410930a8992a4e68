// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

pub mod command;
pub mod controller;
pub mod handle;
pub mod request;
pub mod response;
pub mod state;

use controller::policies::{AdaptivePolling, ExponentialBackoff, PollingPolicy, ReopenPolicy};

/// Stable device identifier, used as the key in the server's device map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Focuser,
    Rotator,
    Telescope,
}

impl DeviceKind {
    pub fn for_backend(kind: BackendKind) -> Self {
        match kind {
            BackendKind::ZwoEaf => Self::Focuser,
            BackendKind::ZwoCaa => Self::Rotator,
            BackendKind::IOptron => Self::Telescope,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub has_temperature: bool,
    pub can_reverse: bool,
    pub can_halt: bool,
    pub can_move: bool,
    pub has_backlash: bool,
    /// Backend accepts a new maximum position.
    pub can_set_max: bool,
    pub can_sync: bool,
    pub can_slew: bool,
    pub can_park: bool,
    pub can_track: bool,
    pub can_home: bool,
}

impl Capabilities {
    pub fn for_backend(kind: BackendKind) -> Self {
        match kind {
            BackendKind::ZwoEaf => Self {
                has_temperature: true,
                can_reverse: true,
                can_halt: true,
                can_move: true,
                has_backlash: true,
                can_set_max: true,
                ..Self::default()
            },
            BackendKind::ZwoCaa => Self {
                can_reverse: true,
                can_halt: true,
                can_move: true,
                can_sync: true,
                ..Self::default()
            },
            BackendKind::IOptron => Self {
                can_halt: true,
                can_slew: true,
                can_park: true,
                can_track: true,
                can_home: true,
                ..Self::default()
            },
        }
    }
}

/// Static identity of one controlled instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub backend: BackendKind,
    /// Position of the device in the backend's enumeration list.
    pub index: usize,
    pub manufacturer: String,
    pub model: String,
    pub capabilities: Capabilities,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, backend: BackendKind, index: usize) -> Self {
        let (manufacturer, model) = match backend {
            BackendKind::ZwoEaf => ("ZWO", "EAF"),
            BackendKind::ZwoCaa => ("ZWO", "CAA"),
            BackendKind::IOptron => ("iOptron", "CEM"),
        };
        let id = id.into();
        Self {
            name: id.clone(),
            id: DeviceId(id),
            kind: DeviceKind::for_backend(backend),
            backend,
            index,
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            capabilities: Capabilities::for_backend(backend),
        }
    }

    /// Positions wrap at 360 degrees.
    pub fn is_angular(&self) -> bool {
        self.kind == DeviceKind::Rotator
    }
}

/// Timing constants, limits and policies for one device.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub temperature_interval: Duration,
    /// Budget for one wire exchange before it resolves as timed out.
    pub command_timeout: Duration,
    /// Delay hint while a reply is outstanding.
    pub reply_poll: Duration,
    /// Moves closer than this to the current position never reach the wire.
    pub position_tolerance: f64,
    pub min_position: Option<f64>,
    pub max_position: Option<f64>,
    pub queue_capacity: usize,
    pub temperature_log_len: usize,
    /// Invalidate the connection after this many consecutive timeouts.
    pub timeout_escalation: Option<u32>,
    pub polling: Arc<dyn PollingPolicy>,
    /// Backoff between reopen attempts; exhausting it marks the device `Degraded`.
    pub reopen: Arc<dyn ReopenPolicy>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            temperature_interval: Duration::from_secs(15),
            command_timeout: Duration::from_secs(2),
            reply_poll: Duration::from_millis(25),
            position_tolerance: 0.1,
            min_position: None,
            max_position: None,
            queue_capacity: 16,
            temperature_log_len: 32,
            timeout_escalation: None,
            polling: Arc::new(AdaptivePolling::default_device()),
            reopen: Arc::new(ExponentialBackoff::default_reopen()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_follow_backend() {
        let eaf = Capabilities::for_backend(BackendKind::ZwoEaf);
        assert!(eaf.has_temperature && eaf.has_backlash && !eaf.can_sync);
        let caa = Capabilities::for_backend(BackendKind::ZwoCaa);
        assert!(caa.can_sync && !caa.has_temperature);
        let mount = Capabilities::for_backend(BackendKind::IOptron);
        assert!(mount.can_slew && mount.can_park && !mount.can_move);
    }

    #[test]
    fn test_device_info_defaults() {
        let info = DeviceInfo::new("rotator", BackendKind::ZwoCaa, 0);
        assert_eq!(info.kind, DeviceKind::Rotator);
        assert!(info.is_angular());
        assert_eq!(info.model, "CAA");
    }
}
