// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! In-memory ZWO SDK.
//!
//! One `SimZwoSdk` is one SDK handle table shared by every device on it,
//! the way the vendor library is loaded once per process. Motion advances
//! a fixed step on every position query. A `SimControl` plugs and unplugs
//! devices and scripts failures while the SDK is owned by an adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use astro_core::backend::BackendKind;
use astro_core::device::controller::classify;

use crate::zwo::ZwoSdk;

const EAF_MAX_STEPS: f64 = 10_000.0;
const EAF_STEP: f64 = 250.0;
const CAA_MAX_DEGREES: f64 = 360.0;
const CAA_STEP: f64 = 5.0;

/// `*_ERROR_MOVING`, same value in both SDKs.
const MOVING: i32 = 5;
const CAA_OUT_RANGE: i32 = 10;

#[derive(Debug, Clone)]
struct Unit {
    id: i32,
    open: bool,
    position: f64,
    target: f64,
    max: f64,
    reverse: bool,
    backlash: i64,
    temperature: f64,
    hand_control: bool,
}

#[derive(Debug)]
struct Table {
    kind: BackendKind,
    units: Vec<Unit>,
    next_id: i32,
    /// Codes returned by the next calls, oldest first.
    script: VecDeque<i32>,
}

impl Table {
    fn plug(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        let (position, max) = match self.kind {
            BackendKind::ZwoEaf => (EAF_MAX_STEPS / 2.0, EAF_MAX_STEPS),
            _ => (0.0, CAA_MAX_DEGREES),
        };
        self.units.push(Unit {
            id,
            open: false,
            position,
            target: position,
            max,
            reverse: false,
            backlash: 0,
            temperature: 12.5,
            hand_control: false,
        });
        id
    }

    /// Unit lookup for data calls: must be plugged and open.
    fn unit(&mut self, id: i32) -> Result<&mut Unit, i32> {
        let table = classify::table(self.kind);
        let known = id < self.next_id;
        match self.units.iter_mut().find(|u| u.id == id) {
            Some(unit) if unit.open => Ok(unit),
            Some(_) => Err(table.closed),
            None if known => Err(table.removed),
            None => Err(table.invalid_id),
        }
    }

    fn step(&self) -> f64 {
        match self.kind {
            BackendKind::ZwoEaf => EAF_STEP,
            _ => CAA_STEP,
        }
    }
}

#[derive(Debug)]
struct Shared {
    table: Mutex<Table>,
    /// Callers currently inside an SDK call.
    active: AtomicUsize,
    /// Calls that found another caller already inside.
    overlaps: AtomicUsize,
    latency: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks one caller inside the SDK for as long as it lives.
struct Entry<'a>(&'a Shared);

impl<'a> Entry<'a> {
    fn new(shared: &'a Shared) -> Self {
        if shared.active.fetch_add(1, Ordering::SeqCst) > 0 {
            shared.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        Self(shared)
    }
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated SDK handle table with `devices` units plugged in.
#[derive(Debug)]
pub struct SimZwoSdk {
    kind: BackendKind,
    shared: Arc<Shared>,
}

impl SimZwoSdk {
    pub fn new(kind: BackendKind, devices: usize) -> Self {
        Self::with_latency(kind, devices, Duration::ZERO)
    }

    /// Every call blocks the calling thread for `latency`, like a USB
    /// round trip inside the vendor library.
    pub fn with_latency(kind: BackendKind, devices: usize, latency: Duration) -> Self {
        let mut table = Table {
            kind,
            units: Vec::new(),
            next_id: 0,
            script: VecDeque::new(),
        };
        for _ in 0..devices {
            table.plug();
        }
        Self {
            kind,
            shared: Arc::new(Shared {
                table: Mutex::new(table),
                active: AtomicUsize::new(0),
                overlaps: AtomicUsize::new(0),
                latency,
            }),
        }
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            shared: self.shared.clone(),
        }
    }

    fn call<T>(&self, f: impl FnOnce(&mut Table) -> Result<T, i32>) -> Result<T, i32> {
        let _entry = Entry::new(&self.shared);
        if !self.shared.latency.is_zero() {
            std::thread::sleep(self.shared.latency);
        }
        let mut table = self.shared.lock();
        if let Some(code) = table.script.pop_front() {
            return Err(code);
        }
        f(&mut *table)
    }
}

impl ZwoSdk for SimZwoSdk {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn device_ids(&mut self) -> Result<Vec<i32>, i32> {
        self.call(|t| Ok(t.units.iter().map(|u| u.id).collect()))
    }

    fn open(&mut self, id: i32) -> Result<(), i32> {
        self.call(|t| {
            let table = classify::table(t.kind);
            let known = id < t.next_id;
            match t.units.iter_mut().find(|u| u.id == id) {
                Some(unit) => {
                    unit.open = true;
                    Ok(())
                }
                None if known => Err(table.removed),
                None => Err(table.invalid_id),
            }
        })
    }

    fn close(&mut self, id: i32) -> Result<(), i32> {
        self.call(|t| {
            t.unit(id)?.open = false;
            Ok(())
        })
    }

    fn position(&mut self, id: i32) -> Result<f64, i32> {
        self.call(|t| {
            let step = t.step();
            let unit = t.unit(id)?;
            let remaining = unit.target - unit.position;
            unit.position += remaining.clamp(-step, step);
            Ok(unit.position)
        })
    }

    fn move_to(&mut self, id: i32, target: f64) -> Result<(), i32> {
        self.call(|t| {
            let table = classify::table(t.kind);
            let kind = t.kind;
            let unit = t.unit(id)?;
            if unit.hand_control {
                return Err(MOVING);
            }
            if !(0.0..=unit.max).contains(&target) {
                // The rotator SDK has a dedicated range code.
                return Err(match kind {
                    BackendKind::ZwoCaa => CAA_OUT_RANGE,
                    _ => table.invalid_value,
                });
            }
            unit.target = target;
            Ok(())
        })
    }

    fn stop(&mut self, id: i32) -> Result<(), i32> {
        self.call(|t| {
            let unit = t.unit(id)?;
            unit.target = unit.position;
            Ok(())
        })
    }

    fn is_moving(&mut self, id: i32) -> Result<(bool, bool), i32> {
        self.call(|t| {
            let unit = t.unit(id)?;
            Ok((unit.position != unit.target, unit.hand_control))
        })
    }

    fn max_position(&mut self, id: i32) -> Result<f64, i32> {
        self.call(|t| Ok(t.unit(id)?.max))
    }

    fn set_max_position(&mut self, id: i32, max: f64) -> Result<(), i32> {
        self.call(|t| {
            let invalid = classify::table(t.kind).invalid_value;
            let unit = t.unit(id)?;
            if max <= 0.0 {
                return Err(invalid);
            }
            unit.max = max;
            Ok(())
        })
    }

    fn reverse(&mut self, id: i32) -> Result<bool, i32> {
        self.call(|t| Ok(t.unit(id)?.reverse))
    }

    fn set_reverse(&mut self, id: i32, reverse: bool) -> Result<(), i32> {
        self.call(|t| {
            t.unit(id)?.reverse = reverse;
            Ok(())
        })
    }

    fn backlash(&mut self, id: i32) -> Result<i64, i32> {
        self.call(|t| match t.kind {
            BackendKind::ZwoEaf => Ok(t.unit(id)?.backlash),
            kind => Err(classify::table(kind).not_supported),
        })
    }

    fn set_backlash(&mut self, id: i32, steps: i64) -> Result<(), i32> {
        self.call(|t| match t.kind {
            BackendKind::ZwoEaf => {
                t.unit(id)?.backlash = steps;
                Ok(())
            }
            kind => Err(classify::table(kind).not_supported),
        })
    }

    fn temperature(&mut self, id: i32) -> Result<f64, i32> {
        self.call(|t| match t.kind {
            BackendKind::ZwoEaf => Ok(t.unit(id)?.temperature),
            kind => Err(classify::table(kind).not_supported),
        })
    }
}

/// Out-of-band control over a `SimZwoSdk` table.
#[derive(Debug, Clone)]
pub struct SimControl {
    shared: Arc<Shared>,
}

impl SimControl {
    /// Plug in a new device; it gets a fresh SDK id.
    pub fn plug(&self) -> i32 {
        self.shared.lock().plug()
    }

    /// Pull the device at enumeration position `index`.
    pub fn unplug(&self, index: usize) -> Option<i32> {
        let mut table = self.shared.lock();
        if index < table.units.len() {
            Some(table.units.remove(index).id)
        } else {
            None
        }
    }

    pub fn device_count(&self) -> usize {
        self.shared.lock().units.len()
    }

    /// Make the next SDK call fail with `code`.
    pub fn fail_next(&self, code: i32) {
        self.shared.lock().script.push_back(code);
    }

    pub fn set_hand_control(&self, index: usize, engaged: bool) {
        if let Some(unit) = self.shared.lock().units.get_mut(index) {
            unit.hand_control = engaged;
        }
    }

    pub fn set_temperature(&self, index: usize, celsius: f64) {
        if let Some(unit) = self.shared.lock().units.get_mut(index) {
            unit.temperature = celsius;
        }
    }

    pub fn position(&self, index: usize) -> Option<f64> {
        self.shared.lock().units.get(index).map(|u| u.position)
    }

    /// Number of SDK calls that started while another was still running.
    pub fn overlapping_calls(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replugged_device_gets_new_id() {
        let mut sdk = SimZwoSdk::new(BackendKind::ZwoEaf, 1);
        let control = sdk.control();
        let first = sdk.device_ids().unwrap();
        sdk.open(first[0]).unwrap();

        control.unplug(0);
        assert_eq!(sdk.position(first[0]), Err(4));
        control.plug();
        let second = sdk.device_ids().unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0], second[0]);
        // Not opened yet.
        assert_eq!(sdk.position(second[0]), Err(9));
    }

    #[test]
    fn test_scripted_failure_is_consumed_once() {
        let mut sdk = SimZwoSdk::new(BackendKind::ZwoCaa, 1);
        sdk.control().fail_next(13);
        assert_eq!(sdk.device_ids(), Err(13));
        assert_eq!(sdk.device_ids(), Ok(vec![0]));
    }

    #[test]
    fn test_rotator_out_of_range() {
        let mut sdk = SimZwoSdk::new(BackendKind::ZwoCaa, 1);
        sdk.open(0).unwrap();
        assert_eq!(sdk.move_to(0, 400.0), Err(CAA_OUT_RANGE));
        assert_eq!(sdk.move_to(0, 90.0), Ok(()));
        assert_eq!(sdk.is_moving(0), Ok((true, false)));
        sdk.stop(0).unwrap();
        assert_eq!(sdk.is_moving(0), Ok((false, false)));
    }

    #[test]
    fn test_hand_control_blocks_moves() {
        let mut sdk = SimZwoSdk::new(BackendKind::ZwoEaf, 1);
        let control = sdk.control();
        sdk.open(0).unwrap();
        control.set_hand_control(0, true);
        assert_eq!(sdk.move_to(0, 100.0), Err(MOVING));
        assert_eq!(sdk.is_moving(0), Ok((false, true)));
    }
}
