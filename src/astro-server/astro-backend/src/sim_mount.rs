// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Simulated iOptron mount behind a line transport.
//!
//! Replies are produced by the same encoders the parser is tested against
//! and handed out a few bytes per read, so frame assembly is exercised the
//! way a slow serial line would.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use astro_core::device::controller::parser::{encode_mount_position, encode_mount_status};
use astro_core::device::state::{MountState, PierSide, TrackingRate};
use astro_core::math::{centi_arcsec_to_deg, format_dec_dms, format_ra_hms};

use crate::ioptron::{LineFuture, LineTransport, PortConnector};

/// Path the simulated mount answers on.
pub const SIM_PORT: &str = "sim://ioptron";

const CHUNK: usize = 8;
const SLEW_STEP_HOURS: f64 = 0.5;
const SLEW_STEP_DEG: f64 = 5.0;

#[derive(Debug)]
struct Model {
    ra_hours: f64,
    dec_deg: f64,
    target_ra: Option<f64>,
    target_dec: Option<f64>,
    pier: PierSide,
    state: MountState,
    tracking_rate: u8,
    latitude: f64,
    longitude: f64,
    plugged: bool,
    /// Swallow commands without replying.
    silent: bool,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            ra_hours: 0.0,
            dec_deg: 90.0,
            target_ra: None,
            target_dec: None,
            pier: PierSide::East,
            state: MountState::Home,
            tracking_rate: 0,
            latitude: 52.2297,
            longitude: 21.0122,
            plugged: true,
            silent: false,
        }
    }
}

fn ack(ok: bool) -> Option<String> {
    Some(if ok { "1" } else { "0" }.to_string())
}

fn approach(from: f64, to: f64, step: f64) -> f64 {
    from + (to - from).clamp(-step, step)
}

impl Model {
    fn respond(&mut self, command: &str) -> Option<String> {
        if self.silent {
            return None;
        }
        let body = command.strip_prefix(':')?.strip_suffix('#')?;
        let parked = self.state == MountState::Parked;
        match body {
            "GEP" => {
                self.advance();
                Some(encode_mount_position(self.ra_hours, self.dec_deg, self.pier))
            }
            "GLS" => Some(encode_mount_status(
                self.longitude,
                self.latitude,
                self.state,
                self.tracking_rate,
            )),
            "GR" => Some(format!("{}#", format_ra_hms(self.ra_hours))),
            "GD" => Some(format!("{}#", format_dec_dms(self.dec_deg))),
            "MS1" => {
                let ok = !parked && self.target_ra.is_some() && self.target_dec.is_some();
                if ok {
                    self.state = MountState::Slewing;
                }
                ack(ok)
            }
            "CM" => {
                let target = self.target_ra.zip(self.target_dec);
                let ok = !parked && !self.state.is_moving() && target.is_some();
                if let (true, Some((ra, dec))) = (ok, target) {
                    self.ra_hours = ra;
                    self.dec_deg = dec;
                }
                ack(ok)
            }
            "Q" => {
                if self.state.is_moving() {
                    self.state = MountState::Stopped;
                }
                ack(true)
            }
            "ST1" | "ST0" => {
                if !parked {
                    self.state = if body == "ST1" {
                        MountState::Tracking
                    } else {
                        MountState::Stopped
                    };
                }
                ack(!parked)
            }
            "MP1" => {
                self.state = MountState::Parked;
                ack(true)
            }
            "MP0" => {
                if parked {
                    self.state = MountState::Stopped;
                }
                ack(true)
            }
            "MH" => {
                if !parked {
                    self.state = MountState::Home;
                    self.dec_deg = 90.0;
                }
                ack(!parked)
            }
            _ => {
                if let Some(digits) = body.strip_prefix("SRA") {
                    let ra = digits.parse::<i64>().ok().map(|v| centi_arcsec_to_deg(v) / 15.0);
                    let ok = ra.is_some_and(|h| (0.0..24.0).contains(&h));
                    if ok {
                        self.target_ra = ra;
                    }
                    ack(ok)
                } else if let Some(value) = body.strip_prefix("Sd") {
                    let dec = value.parse::<i64>().ok().map(centi_arcsec_to_deg);
                    let ok = dec.is_some_and(|d| (-90.0..=90.0).contains(&d));
                    if ok {
                        self.target_dec = dec;
                    }
                    ack(ok)
                } else if let Some(digit) = body.strip_prefix("RT") {
                    let rate = digit.parse::<u8>().ok().and_then(TrackingRate::from_digit);
                    if let Some(rate) = rate {
                        self.tracking_rate = rate.digit();
                    }
                    ack(rate.is_some())
                } else {
                    ack(false)
                }
            }
        }
    }

    /// Move one step toward the slew target.
    fn advance(&mut self) {
        if self.state != MountState::Slewing {
            return;
        }
        let (Some(ra), Some(dec)) = (self.target_ra, self.target_dec) else {
            self.state = MountState::Stopped;
            return;
        };
        self.ra_hours = approach(self.ra_hours, ra, SLEW_STEP_HOURS);
        self.dec_deg = approach(self.dec_deg, dec, SLEW_STEP_DEG);
        if self.ra_hours == ra && self.dec_deg == dec {
            self.state = MountState::Tracking;
            self.pier = if ra < 12.0 {
                PierSide::East
            } else {
                PierSide::West
            };
        }
    }
}

/// Shared mount model; clones control the same mount.
#[derive(Debug, Clone, Default)]
pub struct SimMount {
    model: Arc<Mutex<Model>>,
}

impl SimMount {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            mount: self.clone(),
        }
    }

    pub fn unplug(&self) {
        self.lock().plugged = false;
    }

    pub fn plug(&self) {
        self.lock().plugged = true;
    }

    /// Stop answering, as a mount with a wedged controller does.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    pub fn state(&self) -> MountState {
        self.lock().state
    }

    /// `(ra_hours, dec_deg)`.
    pub fn position(&self) -> (f64, f64) {
        let model = self.lock();
        (model.ra_hours, model.dec_deg)
    }
}

/// `PortConnector` answering only on `SIM_PORT`.
#[derive(Debug, Clone)]
pub struct SimConnector {
    mount: SimMount,
}

impl PortConnector for SimConnector {
    fn present(&self, path: &str) -> bool {
        path == SIM_PORT && self.mount.lock().plugged
    }

    fn connect(&mut self, path: &str) -> io::Result<Box<dyn LineTransport>> {
        if !self.present(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()));
        }
        Ok(Box::new(SimLine {
            mount: self.mount.clone(),
            output: VecDeque::new(),
        }))
    }
}

struct SimLine {
    mount: SimMount,
    output: VecDeque<u8>,
}

impl SimLine {
    fn check_plugged(&self) -> io::Result<()> {
        if self.mount.lock().plugged {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "mount unplugged"))
        }
    }
}

impl LineTransport for SimLine {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> LineFuture<'a, ()> {
        let result = self.check_plugged().map(|()| {
            let command = String::from_utf8_lossy(data);
            if let Some(reply) = self.mount.lock().respond(&command) {
                self.output.extend(reply.into_bytes());
            }
        });
        Box::pin(std::future::ready(result))
    }

    fn read_available<'a>(&'a mut self) -> LineFuture<'a, Vec<u8>> {
        let result = self.check_plugged().map(|()| {
            let n = self.output.len().min(CHUNK);
            self.output.drain(..n).collect()
        });
        Box::pin(std::future::ready(result))
    }

    fn clear_input(&mut self) {
        self.output.clear();
    }
}
