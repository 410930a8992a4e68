// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{PropertyKey, PropertyValue};
use crate::device::state::TrackingRate;

/// Operation requested by the property-serving layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DeviceCommand {
    Move { target: f64 },
    Halt,
    SetReverse { reverse: bool },
    SetMaxPosition { max: f64 },
    SetBacklash { steps: i64 },
    /// Declare the current mechanical position to read as `position`.
    Sync { position: f64 },
    SetTracking { enabled: bool },
    Park,
    Unpark,
    FindHome,
    SlewTo { ra_hours: f64, dec_deg: f64 },
    /// Declare the mount to be pointing at these coordinates.
    SyncTo { ra_hours: f64, dec_deg: f64 },
    SetTrackingRate { rate: TrackingRate },
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Move { .. } => "Move",
            Self::Halt => "Halt",
            Self::SetReverse { .. } => "SetReverse",
            Self::SetMaxPosition { .. } => "SetMaxPosition",
            Self::SetBacklash { .. } => "SetBacklash",
            Self::Sync { .. } => "Sync",
            Self::SetTracking { .. } => "SetTracking",
            Self::Park => "Park",
            Self::Unpark => "Unpark",
            Self::FindHome => "FindHome",
            Self::SlewTo { .. } => "SlewTo",
            Self::SyncTo { .. } => "SyncTo",
            Self::SetTrackingRate { .. } => "SetTrackingRate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlates the wire commands expanded from one `DeviceRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandClass {
    OneShot,
    /// Re-armed by the engine after each resolution.
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum CommandKind {
    Move { target: f64 },
    Halt,
    PollMotion,
    PollPosition,
    PollMountPosition,
    PollMountStatus,
    PollRightAscension,
    PollDeclination,
    PollTemperature,
    Configure(PropertyKey),
    Sync { position: f64 },
    SetTracking,
    SetTrackingRate,
    SetTargetRa,
    SetTargetDec,
    Slew,
    SyncToTarget,
    Park,
    Unpark,
    FindHome,
}

/// Fixed reply layouts of the line-oriented mount protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameLayout {
    /// `:GEP#` position block.
    MountPosition,
    /// `:GLS#` status block.
    MountStatus,
    /// `:GR#` sexagesimal right ascension, read when `:GEP#` garbles.
    RightAscension,
    /// `:GD#` sexagesimal declination, read when `:GEP#` garbles.
    Declination,
}

/// What the device sends back for a wire command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplyShape {
    /// Single `1` (accepted) or `0` (rejected) byte.
    Ack,
    /// `#`-terminated frame.
    Frame(FrameLayout),
    NoReply,
}

/// Backend operation carried by a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange {
    Read(PropertyKey),
    Write(PropertyKey, PropertyValue),
    Wire { payload: Vec<u8>, reply: ReplyShape },
    /// Resolved inside the engine without touching the backend.
    Local,
}

/// One outbound protocol operation awaiting resolution.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    pub class: CommandClass,
    pub exchange: Exchange,
    pub timeout: Duration,
    /// Consecutive failed resolutions of a periodic command.
    pub retries: u32,
    /// Dispatched ahead of queued one-shot and periodic commands.
    pub priority: bool,
    pub request: Option<RequestId>,
}

impl Command {
    pub fn one_shot(kind: CommandKind, exchange: Exchange, timeout: Duration) -> Self {
        Self {
            id: CommandId::new(),
            kind,
            class: CommandClass::OneShot,
            exchange,
            timeout,
            retries: 0,
            priority: false,
            request: None,
        }
    }

    pub fn periodic(kind: CommandKind, exchange: Exchange, timeout: Duration) -> Self {
        Self {
            class: CommandClass::Periodic,
            ..Self::one_shot(kind, exchange, timeout)
        }
    }

    pub fn with_priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn wire(kind: CommandKind, payload: &str, reply: ReplyShape, timeout: Duration) -> Self {
        Self::one_shot(
            kind,
            Exchange::Wire {
                payload: payload.as_bytes().to_vec(),
                reply,
            },
            timeout,
        )
    }

    pub fn is_periodic(&self) -> bool {
        self.class == CommandClass::Periodic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_periodic_keeps_exchange() {
        let cmd = Command::periodic(
            CommandKind::PollMotion,
            Exchange::Read(PropertyKey::Moving),
            Duration::from_secs(1),
        );
        assert!(cmd.is_periodic());
        assert!(!cmd.priority);
        assert_eq!(cmd.exchange, Exchange::Read(PropertyKey::Moving));
    }

    #[test]
    fn test_device_command_json() {
        let cmd: DeviceCommand = serde_json::from_str(r#"{"cmd":"move","target":1200.0}"#).unwrap();
        assert_eq!(cmd, DeviceCommand::Move { target: 1200.0 });
        assert_eq!(cmd.name(), "Move");

        let cmd: DeviceCommand =
            serde_json::from_str(r#"{"cmd":"set_tracking_rate","rate":"lunar"}"#).unwrap();
        assert_eq!(
            cmd,
            DeviceCommand::SetTrackingRate {
                rate: TrackingRate::Lunar
            }
        );
        assert!(serde_json::from_str::<DeviceCommand>(r#"{"cmd":"set_tracking_rate","rate":"warp"}"#).is_err());
    }
}
