// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Request validation and expansion into queued commands.
//!
//! Every request is checked against the device's capabilities, its
//! parameters and the connection before anything is queued, so invalid
//! requests never generate wire traffic. Accepted requests expand into one
//! or more `Command`s that the queue dispatches in order.

use std::time::Duration;

use crate::backend::{BackendKind, PropertyKey, PropertyValue};
use crate::device::command::{Command, CommandKind, DeviceCommand, Exchange, FrameLayout, ReplyShape};
use crate::device::response::{DeviceError, DeviceResult};
use crate::device::state::PropertySnapshot;
use crate::device::DeviceInfo;
use crate::math::{deg_to_centi_arcsec, normalize_degrees};

/// Largest backlash the focuser firmware accepts.
const MAX_BACKLASH: i64 = 255;

/// Result of command validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Ok,
    NotConnected,
    InvalidParams(String),
    /// The device lacks the capability.
    Unsupported(String),
    /// The device is in a state where the command cannot run.
    Busy(String),
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn into_result(self) -> DeviceResult<()> {
        match self {
            Self::Ok => Ok(()),
            Self::NotConnected => Err(DeviceError::ConnectionLost("device is not open".into())),
            Self::InvalidParams(msg) => Err(DeviceError::InvalidRequest(msg)),
            Self::Unsupported(msg) => Err(DeviceError::NotSupported(msg)),
            Self::Busy(msg) => Err(DeviceError::HardwareBusy(msg)),
        }
    }
}

/// Read access to the device a command targets.
pub trait CommandContext {
    fn info(&self) -> &DeviceInfo;

    fn snapshot(&self) -> &PropertySnapshot;

    fn is_open(&self) -> bool {
        self.snapshot().is_open()
    }

    fn is_moving(&self) -> bool {
        self.snapshot().moving
    }
}

impl CommandContext for (&DeviceInfo, &PropertySnapshot) {
    fn info(&self) -> &DeviceInfo {
        self.0
    }

    fn snapshot(&self) -> &PropertySnapshot {
        self.1
    }
}

fn supported(cmd: &DeviceCommand, info: &DeviceInfo) -> bool {
    let caps = &info.capabilities;
    match cmd {
        DeviceCommand::Move { .. } => caps.can_move,
        DeviceCommand::Halt => caps.can_halt,
        DeviceCommand::SetReverse { .. } => caps.can_reverse,
        DeviceCommand::SetMaxPosition { .. } => caps.can_set_max,
        DeviceCommand::SetBacklash { .. } => caps.has_backlash,
        DeviceCommand::Sync { .. } => caps.can_sync,
        DeviceCommand::SetTracking { .. } => caps.can_track,
        DeviceCommand::Park | DeviceCommand::Unpark => caps.can_park,
        DeviceCommand::FindHome => caps.can_home,
        DeviceCommand::SlewTo { .. } | DeviceCommand::SyncTo { .. } => caps.can_slew,
        DeviceCommand::SetTrackingRate { .. } => caps.can_track,
    }
}

fn check_params(cmd: &DeviceCommand, ctx: &dyn CommandContext) -> ValidationResult {
    let snapshot = ctx.snapshot();
    match *cmd {
        DeviceCommand::Move { target } => {
            if !target.is_finite() {
                return ValidationResult::InvalidParams(format!("target {} is not finite", target));
            }
            if ctx.info().is_angular() {
                let angle = normalize_degrees(target);
                let max = snapshot.max_position.unwrap_or(360.0);
                if angle > max {
                    return ValidationResult::InvalidParams(format!(
                        "angle {:.2} exceeds max {:.2}",
                        angle, max
                    ));
                }
            } else {
                if let Some(min) = snapshot.min_position.filter(|min| target < *min) {
                    return ValidationResult::InvalidParams(format!(
                        "target {} below min {}",
                        target, min
                    ));
                }
                if let Some(max) = snapshot.max_position.filter(|max| target > *max) {
                    return ValidationResult::InvalidParams(format!(
                        "target {} above max {}",
                        target, max
                    ));
                }
            }
        }
        DeviceCommand::SetMaxPosition { max } => {
            if !max.is_finite() || max <= 0.0 {
                return ValidationResult::InvalidParams(format!("max position {} must be positive", max));
            }
        }
        DeviceCommand::SetBacklash { steps } => {
            if !(0..=MAX_BACKLASH).contains(&steps) {
                return ValidationResult::InvalidParams(format!(
                    "backlash {} outside 0..={}",
                    steps, MAX_BACKLASH
                ));
            }
        }
        DeviceCommand::Sync { position } => {
            if !position.is_finite() {
                return ValidationResult::InvalidParams(format!("sync position {} is not finite", position));
            }
        }
        DeviceCommand::SlewTo { ra_hours, dec_deg } | DeviceCommand::SyncTo { ra_hours, dec_deg } => {
            if !(0.0..24.0).contains(&ra_hours) {
                return ValidationResult::InvalidParams(format!("RA {} outside [0, 24)", ra_hours));
            }
            if !(-90.0..=90.0).contains(&dec_deg) {
                return ValidationResult::InvalidParams(format!("Dec {} outside [-90, 90]", dec_deg));
            }
        }
        _ => {}
    }
    ValidationResult::Ok
}

/// Validate a request without side effects: capability first, then
/// parameters, then connection and device state.
pub fn validate(cmd: &DeviceCommand, ctx: &dyn CommandContext) -> ValidationResult {
    let info = ctx.info();
    if !supported(cmd, info) {
        return ValidationResult::Unsupported(format!("{} on {} {}", cmd.name(), info.manufacturer, info.model));
    }
    let params = check_params(cmd, ctx);
    if !params.is_ok() {
        return params;
    }
    if !ctx.is_open() {
        return ValidationResult::NotConnected;
    }
    let mount = &ctx.snapshot().mount;
    let parked = mount.is_parked();
    let slewing = mount.state.is_some_and(|state| state.is_moving());
    match cmd {
        DeviceCommand::SlewTo { .. }
        | DeviceCommand::SyncTo { .. }
        | DeviceCommand::FindHome
        | DeviceCommand::SetTracking { enabled: true }
            if parked =>
        {
            ValidationResult::Busy("mount is parked".into())
        }
        DeviceCommand::SyncTo { .. } if slewing => ValidationResult::Busy("mount is slewing".into()),
        _ => ValidationResult::Ok,
    }
}

/// Stop command for a backend kind, always dispatched ahead of the queue.
pub fn halt_command(kind: BackendKind, timeout: Duration) -> Command {
    let command = if kind.is_line_oriented() {
        Command::wire(CommandKind::Halt, ":Q#", ReplyShape::Ack, timeout)
    } else {
        Command::one_shot(
            CommandKind::Halt,
            Exchange::Write(PropertyKey::Halt, PropertyValue::Bool(true)),
            timeout,
        )
    };
    command.with_priority()
}

fn position_value(kind: BackendKind, value: f64) -> PropertyValue {
    match kind {
        // Focuser positions are whole steps.
        BackendKind::ZwoEaf => PropertyValue::Int(value.round() as i64),
        _ => PropertyValue::Float(value),
    }
}

fn configure(key: PropertyKey, value: PropertyValue, timeout: Duration) -> Command {
    Command::one_shot(CommandKind::Configure(key), Exchange::Write(key, value), timeout)
}

/// `:SRA` and `:Sd` loading the mount's target coordinates.
fn target_commands(ra_hours: f64, dec_deg: f64, timeout: Duration) -> [Command; 2] {
    let ra = deg_to_centi_arcsec(ra_hours * 15.0);
    let dec = deg_to_centi_arcsec(dec_deg);
    let sign = if dec < 0 { '-' } else { '+' };
    [
        Command::wire(CommandKind::SetTargetRa, &format!(":SRA{:09}#", ra), ReplyShape::Ack, timeout),
        Command::wire(
            CommandKind::SetTargetDec,
            &format!(":Sd{}{:08}#", sign, dec.abs()),
            ReplyShape::Ack,
            timeout,
        ),
    ]
}

/// Expand a validated request into the commands that carry it out.
pub fn commands_for(cmd: &DeviceCommand, ctx: &dyn CommandContext, timeout: Duration) -> Vec<Command> {
    let info = ctx.info();
    let kind = info.backend;
    match *cmd {
        DeviceCommand::Move { target } => {
            let snapshot = ctx.snapshot();
            let target = if info.is_angular() {
                normalize_degrees(target)
            } else {
                target
            };
            let mechanical = snapshot.mechanical(target);
            let step = Command::one_shot(
                CommandKind::Move { target },
                Exchange::Write(PropertyKey::Target, position_value(kind, mechanical)),
                timeout,
            );
            // The rotator refuses a new target while turning.
            if info.is_angular() && ctx.is_moving() {
                vec![halt_command(kind, timeout), step]
            } else {
                vec![step]
            }
        }
        DeviceCommand::Halt => vec![halt_command(kind, timeout)],
        DeviceCommand::SetReverse { reverse } => {
            vec![configure(PropertyKey::Reverse, PropertyValue::Bool(reverse), timeout)]
        }
        DeviceCommand::SetMaxPosition { max } => {
            vec![configure(PropertyKey::MaxPosition, position_value(kind, max), timeout)]
        }
        DeviceCommand::SetBacklash { steps } => {
            vec![configure(PropertyKey::Backlash, PropertyValue::Int(steps), timeout)]
        }
        DeviceCommand::Sync { position } => {
            let position = if info.is_angular() {
                normalize_degrees(position)
            } else {
                position
            };
            vec![Command::one_shot(
                CommandKind::Sync { position },
                Exchange::Local,
                timeout,
            )]
        }
        DeviceCommand::SetTracking { enabled } => {
            let payload = if enabled { ":ST1#" } else { ":ST0#" };
            vec![Command::wire(CommandKind::SetTracking, payload, ReplyShape::Ack, timeout)]
        }
        DeviceCommand::Park => vec![Command::wire(CommandKind::Park, ":MP1#", ReplyShape::Ack, timeout)],
        DeviceCommand::Unpark => vec![Command::wire(CommandKind::Unpark, ":MP0#", ReplyShape::Ack, timeout)],
        DeviceCommand::FindHome => vec![Command::wire(CommandKind::FindHome, ":MH#", ReplyShape::Ack, timeout)],
        DeviceCommand::SlewTo { ra_hours, dec_deg } => {
            let mut commands = Vec::from(target_commands(ra_hours, dec_deg, timeout));
            commands.push(Command::wire(CommandKind::Slew, ":MS1#", ReplyShape::Ack, timeout));
            commands
        }
        DeviceCommand::SyncTo { ra_hours, dec_deg } => {
            let mut commands = Vec::from(target_commands(ra_hours, dec_deg, timeout));
            commands.push(Command::wire(CommandKind::SyncToTarget, ":CM#", ReplyShape::Ack, timeout));
            commands
        }
        DeviceCommand::SetTrackingRate { rate } => vec![Command::wire(
            CommandKind::SetTrackingRate,
            &format!(":RT{}#", rate.digit()),
            ReplyShape::Ack,
            timeout,
        )],
    }
}

/// Sexagesimal reads standing in for a `:GEP#` block that did not parse.
pub fn coordinate_fallback(timeout: Duration) -> Vec<Command> {
    vec![
        Command::wire(
            CommandKind::PollRightAscension,
            ":GR#",
            ReplyShape::Frame(FrameLayout::RightAscension),
            timeout,
        ),
        Command::wire(
            CommandKind::PollDeclination,
            ":GD#",
            ReplyShape::Frame(FrameLayout::Declination),
            timeout,
        ),
    ]
}

/// Status commands re-armed by the engine for the device's lifetime.
pub fn periodic_commands(kind: BackendKind, timeout: Duration) -> Vec<Command> {
    if kind.is_line_oriented() {
        vec![
            Command::periodic(
                CommandKind::PollMountPosition,
                Exchange::Wire {
                    payload: b":GEP#".to_vec(),
                    reply: ReplyShape::Frame(FrameLayout::MountPosition),
                },
                timeout,
            ),
            Command::periodic(
                CommandKind::PollMountStatus,
                Exchange::Wire {
                    payload: b":GLS#".to_vec(),
                    reply: ReplyShape::Frame(FrameLayout::MountStatus),
                },
                timeout,
            ),
        ]
    } else {
        vec![
            Command::periodic(
                CommandKind::PollMotion,
                Exchange::Read(PropertyKey::Moving),
                timeout,
            ),
            Command::periodic(
                CommandKind::PollPosition,
                Exchange::Read(PropertyKey::Position),
                timeout,
            ),
        ]
    }
}

/// Properties read right after every open, in order.
pub fn hydration_keys(kind: BackendKind) -> &'static [PropertyKey] {
    match kind {
        BackendKind::ZwoEaf => &[
            PropertyKey::MaxPosition,
            PropertyKey::Position,
            PropertyKey::Moving,
            PropertyKey::Reverse,
            PropertyKey::Backlash,
            PropertyKey::Temperature,
        ],
        BackendKind::ZwoCaa => &[
            PropertyKey::MaxPosition,
            PropertyKey::Position,
            PropertyKey::Moving,
            PropertyKey::Reverse,
        ],
        BackendKind::IOptron => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::state::{ConnectionState, MountState, TrackingRate};

    fn payloads(commands: Vec<Command>) -> Vec<String> {
        commands
            .into_iter()
            .map(|c| match c.exchange {
                Exchange::Wire { payload, .. } => String::from_utf8(payload).unwrap(),
                other => panic!("unexpected exchange {:?}", other),
            })
            .collect()
    }

    fn open_snapshot(info: &DeviceInfo) -> PropertySnapshot {
        let mut snapshot = PropertySnapshot::new(info.is_angular());
        snapshot.connection = ConnectionState::Open;
        snapshot
    }

    #[test]
    fn test_capability_checked_before_connection() {
        let info = DeviceInfo::new("focuser", BackendKind::ZwoEaf, 0);
        let snapshot = PropertySnapshot::new(false);
        let ctx = (&info, &snapshot);
        assert!(matches!(
            validate(&DeviceCommand::Park, &ctx),
            ValidationResult::Unsupported(_)
        ));
        assert_eq!(
            validate(&DeviceCommand::Move { target: 10.0 }, &ctx),
            ValidationResult::NotConnected
        );
    }

    #[test]
    fn test_focuser_limits() {
        let info = DeviceInfo::new("focuser", BackendKind::ZwoEaf, 0);
        let mut snapshot = open_snapshot(&info);
        snapshot.min_position = Some(0.0);
        snapshot.max_position = Some(10_000.0);
        let ctx = (&info, &snapshot);

        assert!(validate(&DeviceCommand::Move { target: 5_000.0 }, &ctx).is_ok());
        assert!(matches!(
            validate(&DeviceCommand::Move { target: 10_001.0 }, &ctx),
            ValidationResult::InvalidParams(_)
        ));
        assert!(matches!(
            validate(&DeviceCommand::Move { target: f64::NAN }, &ctx),
            ValidationResult::InvalidParams(_)
        ));
        assert!(matches!(
            validate(&DeviceCommand::SetBacklash { steps: 256 }, &ctx),
            ValidationResult::InvalidParams(_)
        ));
        assert!(validate(&DeviceCommand::SetBacklash { steps: 255 }, &ctx).is_ok());
    }

    #[test]
    fn test_rotator_normalizes_and_checks_max_degree() {
        let info = DeviceInfo::new("rotator", BackendKind::ZwoCaa, 0);
        let mut snapshot = open_snapshot(&info);
        snapshot.max_position = Some(270.0);
        let ctx = (&info, &snapshot);

        // -10 wraps to 350, past the limit.
        assert!(!validate(&DeviceCommand::Move { target: -10.0 }, &ctx).is_ok());
        assert!(validate(&DeviceCommand::Move { target: 370.0 }, &ctx).is_ok());

        let commands = commands_for(&DeviceCommand::Move { target: 370.0 }, &ctx, Duration::from_secs(1));
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind, CommandKind::Move { target: 10.0 });
        assert_eq!(
            commands[0].exchange,
            Exchange::Write(PropertyKey::Target, PropertyValue::Float(10.0))
        );
    }

    #[test]
    fn test_moving_rotator_gets_halt_first() {
        let info = DeviceInfo::new("rotator", BackendKind::ZwoCaa, 0);
        let mut snapshot = open_snapshot(&info);
        snapshot.moving = true;
        snapshot.sync_offset = 5.0;
        let ctx = (&info, &snapshot);

        let commands = commands_for(&DeviceCommand::Move { target: 90.0 }, &ctx, Duration::from_secs(1));
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].kind, CommandKind::Halt);
        assert!(commands[0].priority);
        assert_eq!(
            commands[1].exchange,
            Exchange::Write(PropertyKey::Target, PropertyValue::Float(85.0))
        );
    }

    #[test]
    fn test_slew_expands_to_three_wire_commands() {
        let info = DeviceInfo::new("mount", BackendKind::IOptron, 0);
        let snapshot = open_snapshot(&info);
        let ctx = (&info, &snapshot);
        let cmd = DeviceCommand::SlewTo {
            ra_hours: 6.0,
            dec_deg: -12.5,
        };
        assert!(validate(&cmd, &ctx).is_ok());

        assert_eq!(
            payloads(commands_for(&cmd, &ctx, Duration::from_secs(1))),
            vec![":SRA032400000#", ":Sd-04500000#", ":MS1#"]
        );
    }

    #[test]
    fn test_parked_mount_refuses_slew() {
        let info = DeviceInfo::new("mount", BackendKind::IOptron, 0);
        let mut snapshot = open_snapshot(&info);
        snapshot.mount.state = Some(MountState::Parked);
        let ctx = (&info, &snapshot);
        assert!(matches!(
            validate(&DeviceCommand::FindHome, &ctx),
            ValidationResult::Busy(_)
        ));
        assert!(validate(&DeviceCommand::Unpark, &ctx).is_ok());
        assert!(matches!(
            validate(
                &DeviceCommand::SlewTo {
                    ra_hours: 24.0,
                    dec_deg: 0.0
                },
                &ctx
            ),
            ValidationResult::InvalidParams(_)
        ));
    }

    #[test]
    fn test_periodic_commands_per_backend() {
        let sdk = periodic_commands(BackendKind::ZwoEaf, Duration::from_secs(1));
        assert!(sdk.iter().all(|c| c.is_periodic()));
        assert_eq!(sdk[0].exchange, Exchange::Read(PropertyKey::Moving));
        let mount = periodic_commands(BackendKind::IOptron, Duration::from_secs(1));
        assert_eq!(mount[1].kind, CommandKind::PollMountStatus);
        assert!(hydration_keys(BackendKind::IOptron).is_empty());
    }

    #[test]
    fn test_mount_sync_loads_target_then_syncs() {
        let info = DeviceInfo::new("mount", BackendKind::IOptron, 0);
        let mut snapshot = open_snapshot(&info);
        snapshot.mount.state = Some(MountState::Tracking);
        let ctx = (&info, &snapshot);
        let cmd = DeviceCommand::SyncTo {
            ra_hours: 6.0,
            dec_deg: -12.5,
        };
        assert!(validate(&cmd, &ctx).is_ok());

        let commands = commands_for(&cmd, &ctx, Duration::from_secs(1));
        assert_eq!(commands[2].kind, CommandKind::SyncToTarget);
        assert_eq!(
            payloads(commands),
            vec![":SRA032400000#", ":Sd-04500000#", ":CM#"]
        );
    }

    #[test]
    fn test_mount_sync_refused_out_of_range_or_while_slewing() {
        let info = DeviceInfo::new("mount", BackendKind::IOptron, 0);
        let mut snapshot = open_snapshot(&info);
        let bad_dec = DeviceCommand::SyncTo {
            ra_hours: 1.0,
            dec_deg: 91.0,
        };
        assert!(matches!(
            validate(&bad_dec, &(&info, &snapshot)),
            ValidationResult::InvalidParams(_)
        ));

        snapshot.mount.state = Some(MountState::Slewing);
        let cmd = DeviceCommand::SyncTo {
            ra_hours: 1.0,
            dec_deg: 10.0,
        };
        assert!(matches!(
            validate(&cmd, &(&info, &snapshot)),
            ValidationResult::Busy(_)
        ));
        snapshot.mount.state = Some(MountState::Parked);
        assert!(matches!(
            validate(&cmd, &(&info, &snapshot)),
            ValidationResult::Busy(_)
        ));

        let rotator = DeviceInfo::new("rotator", BackendKind::ZwoCaa, 0);
        assert!(matches!(
            validate(&cmd, &(&rotator, &open_snapshot(&rotator))),
            ValidationResult::Unsupported(_)
        ));
    }

    #[test]
    fn test_tracking_rate_is_one_wire_command() {
        let info = DeviceInfo::new("mount", BackendKind::IOptron, 0);
        let snapshot = open_snapshot(&info);
        let ctx = (&info, &snapshot);
        let cmd = DeviceCommand::SetTrackingRate {
            rate: TrackingRate::King,
        };
        assert!(validate(&cmd, &ctx).is_ok());
        assert_eq!(payloads(commands_for(&cmd, &ctx, Duration::from_secs(1))), vec![":RT3#"]);

        let focuser = DeviceInfo::new("focuser", BackendKind::ZwoEaf, 0);
        assert!(matches!(
            validate(&cmd, &(&focuser, &open_snapshot(&focuser))),
            ValidationResult::Unsupported(_)
        ));
    }

    #[test]
    fn test_coordinate_fallback_reads_sexagesimal_frames() {
        let commands = coordinate_fallback(Duration::from_secs(1));
        assert!(commands.iter().all(|c| !c.is_periodic()));
        assert_eq!(payloads(commands), vec![":GR#", ":GD#"]);
    }
}
