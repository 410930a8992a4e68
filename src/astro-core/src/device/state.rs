// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::response::DeviceError;
use crate::math::normalize_degrees;

/// Connection state owned by the lifecycle manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Closed,
    Opening,
    Open,
    /// Reopen attempts keep failing past the fast retry budget.
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::Opening => "Opening",
            Self::Open => "Open",
            Self::Degraded => "Degraded",
        };
        f.write_str(name)
    }
}

/// Rate-limit class for sub-polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollClass {
    Status,
    Temperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PierSide {
    East,
    West,
    Unknown,
}

/// System status digit of the mount status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountState {
    Stopped,
    Tracking,
    Slewing,
    Guiding,
    MeridianFlip,
    TrackingPec,
    Parked,
    Home,
}

impl MountState {
    pub fn from_digit(digit: u8) -> Option<Self> {
        Some(match digit {
            0 => Self::Stopped,
            1 => Self::Tracking,
            2 => Self::Slewing,
            3 => Self::Guiding,
            4 => Self::MeridianFlip,
            5 => Self::TrackingPec,
            6 => Self::Parked,
            7 => Self::Home,
            _ => return None,
        })
    }

    pub fn digit(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Tracking => 1,
            Self::Slewing => 2,
            Self::Guiding => 3,
            Self::MeridianFlip => 4,
            Self::TrackingPec => 5,
            Self::Parked => 6,
            Self::Home => 7,
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(self, Self::Slewing | Self::MeridianFlip)
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self, Self::Tracking | Self::TrackingPec | Self::Guiding)
    }
}

/// Tracking-rate digit of the status block, also sent as `:RTn#`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingRate {
    Sidereal,
    Lunar,
    Solar,
    King,
    Custom,
}

impl TrackingRate {
    pub fn from_digit(digit: u8) -> Option<Self> {
        Some(match digit {
            0 => Self::Sidereal,
            1 => Self::Lunar,
            2 => Self::Solar,
            3 => Self::King,
            4 => Self::Custom,
            _ => return None,
        })
    }

    pub fn digit(&self) -> u8 {
        match self {
            Self::Sidereal => 0,
            Self::Lunar => 1,
            Self::Solar => 2,
            Self::King => 3,
            Self::Custom => 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MountStatus {
    pub ra_hours: Option<f64>,
    pub dec_deg: Option<f64>,
    pub pier_side: Option<PierSide>,
    pub state: Option<MountState>,
    pub tracking_rate: Option<u8>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl MountStatus {
    pub fn is_parked(&self) -> bool {
        self.state == Some(MountState::Parked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureSample {
    pub at_ms: u64,
    pub celsius: f64,
}

/// Last-committed property values of one device.
///
/// Mutated only by the owning device's tick and published whole, so
/// readers see either the pre-tick or the post-tick value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PropertySnapshot {
    pub connection: ConnectionState,
    /// Reported position: mechanical position plus sync offset.
    pub position: Option<f64>,
    pub mechanical_position: Option<f64>,
    pub target_position: Option<f64>,
    pub sync_offset: f64,
    pub moving: bool,
    pub hand_control: bool,
    pub temperature_c: Option<f64>,
    pub temperature_log: VecDeque<TemperatureSample>,
    pub min_position: Option<f64>,
    pub max_position: Option<f64>,
    pub reverse: Option<bool>,
    pub backlash: Option<i64>,
    pub mount: MountStatus,
    pub comm_errors: u64,
    pub last_update_ms: Option<u64>,
    pub last_error: Option<DeviceError>,
    /// Positions are degrees and wrap at 360.
    pub angular: bool,
}

impl PropertySnapshot {
    pub fn new(angular: bool) -> Self {
        Self {
            angular,
            ..Self::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection == ConnectionState::Open
    }

    /// Mechanical position to reported position.
    pub fn reported(&self, mechanical: f64) -> f64 {
        if self.angular {
            normalize_degrees(mechanical + self.sync_offset)
        } else {
            mechanical + self.sync_offset
        }
    }

    /// Reported position to mechanical position.
    pub fn mechanical(&self, reported: f64) -> f64 {
        if self.angular {
            normalize_degrees(reported - self.sync_offset)
        } else {
            reported - self.sync_offset
        }
    }

    /// Distance from the current reported position, shortest way round
    /// for angular devices.
    pub fn distance_to(&self, target: f64) -> Option<f64> {
        let position = self.position?;
        let diff = (target - position).abs();
        Some(if self.angular {
            let wrapped = diff % 360.0;
            wrapped.min(360.0 - wrapped)
        } else {
            diff
        })
    }

    /// Apply a resolved delta. Called once per tick.
    pub fn apply(&mut self, delta: PropertyDelta, now_ms: u64, temperature_log_len: usize) {
        if delta.is_empty() {
            return;
        }
        if let Some(offset) = delta.sync_offset {
            self.sync_offset = offset;
        }
        if let Some(mechanical) = delta.position {
            self.mechanical_position = Some(mechanical);
        }
        if delta.position.is_some() || delta.sync_offset.is_some() {
            self.position = self.mechanical_position.map(|m| self.reported(m));
        }
        if let Some(state) = delta.mount_state {
            self.mount.state = Some(state);
            self.moving = state.is_moving();
        }
        if let Some(moving) = delta.moving {
            self.moving = moving;
        }
        if let Some(hand_control) = delta.hand_control {
            self.hand_control = hand_control;
        }
        if let Some(celsius) = delta.temperature_c {
            self.temperature_c = Some(celsius);
            if temperature_log_len > 0 {
                while self.temperature_log.len() >= temperature_log_len {
                    self.temperature_log.pop_front();
                }
                self.temperature_log.push_back(TemperatureSample {
                    at_ms: now_ms,
                    celsius,
                });
            }
        }
        if delta.min_position.is_some() {
            self.min_position = delta.min_position;
        }
        if delta.max_position.is_some() {
            self.max_position = delta.max_position;
        }
        if delta.reverse.is_some() {
            self.reverse = delta.reverse;
        }
        if delta.backlash.is_some() {
            self.backlash = delta.backlash;
        }
        if delta.ra_hours.is_some() {
            self.mount.ra_hours = delta.ra_hours;
        }
        if delta.dec_deg.is_some() {
            self.mount.dec_deg = delta.dec_deg;
        }
        if delta.pier_side.is_some() {
            self.mount.pier_side = delta.pier_side;
        }
        if delta.tracking_rate.is_some() {
            self.mount.tracking_rate = delta.tracking_rate;
        }
        if delta.latitude.is_some() {
            self.mount.latitude = delta.latitude;
        }
        if delta.longitude.is_some() {
            self.mount.longitude = delta.longitude;
        }
        if delta.target_position.is_some() {
            self.target_position = delta.target_position;
        }
        // Target tracks the actual position while idle.
        if !self.moving && self.position.is_some() {
            self.target_position = self.position;
        }
        self.last_update_ms = Some(now_ms);
    }
}

/// Property changes produced by one resolved exchange.
///
/// Parsers return deltas instead of touching the snapshot; the tick merges
/// them and applies the result once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDelta {
    /// Mechanical position in device units.
    pub position: Option<f64>,
    /// Reported units.
    pub target_position: Option<f64>,
    pub moving: Option<bool>,
    pub hand_control: Option<bool>,
    pub temperature_c: Option<f64>,
    pub min_position: Option<f64>,
    pub max_position: Option<f64>,
    pub reverse: Option<bool>,
    pub backlash: Option<i64>,
    pub sync_offset: Option<f64>,
    pub ra_hours: Option<f64>,
    pub dec_deg: Option<f64>,
    pub pier_side: Option<PierSide>,
    pub mount_state: Option<MountState>,
    pub tracking_rate: Option<u8>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl PropertyDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold a later delta into this one; later values win.
    pub fn merge(&mut self, later: PropertyDelta) {
        self.position = later.position.or(self.position);
        self.target_position = later.target_position.or(self.target_position);
        self.moving = later.moving.or(self.moving);
        self.hand_control = later.hand_control.or(self.hand_control);
        self.temperature_c = later.temperature_c.or(self.temperature_c);
        self.min_position = later.min_position.or(self.min_position);
        self.max_position = later.max_position.or(self.max_position);
        self.reverse = later.reverse.or(self.reverse);
        self.backlash = later.backlash.or(self.backlash);
        self.sync_offset = later.sync_offset.or(self.sync_offset);
        self.ra_hours = later.ra_hours.or(self.ra_hours);
        self.dec_deg = later.dec_deg.or(self.dec_deg);
        self.pier_side = later.pier_side.or(self.pier_side);
        self.mount_state = later.mount_state.or(self.mount_state);
        self.tracking_rate = later.tracking_rate.or(self.tracking_rate);
        self.latitude = later.latitude.or(self.latitude);
        self.longitude = later.longitude.or(self.longitude);
    }
}
