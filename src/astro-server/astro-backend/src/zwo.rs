// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! ZWO EAF focuser and CAA rotator adapter.
//!
//! Both SDKs have the same shape: one process-wide handle table addressed
//! by integer device ids, and synchronous calls that return a result code.
//! `ZwoBackend` maps that onto typed property reads and writes. EAF
//! positions are integer steps, CAA positions are degrees.

use std::collections::HashMap;

use tracing::debug;

use astro_core::backend::{
    Backend, BackendError, BackendFuture, BackendId, BackendKind, Handle, PropertyKey,
    PropertyValue,
};
use astro_core::device::controller::classify;

/// Synchronous binding to one ZWO SDK. Errors are raw SDK result codes.
pub trait ZwoSdk: Send {
    /// `ZwoEaf` or `ZwoCaa`; selects the code table.
    fn kind(&self) -> BackendKind;

    /// Ids of every connected device, in SDK enumeration order.
    fn device_ids(&mut self) -> Result<Vec<i32>, i32>;

    fn open(&mut self, id: i32) -> Result<(), i32>;

    fn close(&mut self, id: i32) -> Result<(), i32>;

    fn position(&mut self, id: i32) -> Result<f64, i32>;

    fn move_to(&mut self, id: i32, target: f64) -> Result<(), i32>;

    fn stop(&mut self, id: i32) -> Result<(), i32>;

    /// `(moving, hand_control)`.
    fn is_moving(&mut self, id: i32) -> Result<(bool, bool), i32>;

    fn max_position(&mut self, id: i32) -> Result<f64, i32>;

    fn set_max_position(&mut self, id: i32, max: f64) -> Result<(), i32>;

    fn reverse(&mut self, id: i32) -> Result<bool, i32>;

    fn set_reverse(&mut self, id: i32, reverse: bool) -> Result<(), i32>;

    fn backlash(&mut self, _id: i32) -> Result<i64, i32> {
        Err(classify::table(self.kind()).not_supported)
    }

    fn set_backlash(&mut self, _id: i32, _steps: i64) -> Result<(), i32> {
        Err(classify::table(self.kind()).not_supported)
    }

    fn temperature(&mut self, _id: i32) -> Result<f64, i32> {
        Err(classify::table(self.kind()).not_supported)
    }
}

/// `Backend` over a ZWO SDK binding.
pub struct ZwoBackend<S> {
    sdk: S,
    /// Enumerated id strings back to SDK ids, refreshed on every enumerate.
    ids: HashMap<BackendId, i32>,
}

impl<S: ZwoSdk> ZwoBackend<S> {
    pub fn new(sdk: S) -> Self {
        Self {
            sdk,
            ids: HashMap::new(),
        }
    }

    fn error(&self, code: i32, op: &str) -> BackendError {
        let kind = self.sdk.kind();
        BackendError::new(
            code,
            format!("{} {} ({})", kind, op, classify::code_name(kind, code)),
        )
    }

    fn sdk_id(&self, handle: Handle) -> Result<i32, BackendError> {
        i32::try_from(handle.0)
            .map_err(|_| self.error(classify::table(self.sdk.kind()).invalid_id, "handle"))
    }

    /// Steps for the focuser, degrees for the rotator.
    fn scalar(&self, value: f64) -> PropertyValue {
        match self.sdk.kind() {
            BackendKind::ZwoEaf => PropertyValue::Int(value.round() as i64),
            _ => PropertyValue::Float(value),
        }
    }

    fn read(&mut self, id: i32, key: PropertyKey) -> Result<PropertyValue, i32> {
        let not_supported = classify::table(self.sdk.kind()).not_supported;
        Ok(match key {
            PropertyKey::Position => {
                let position = self.sdk.position(id)?;
                self.scalar(position)
            }
            PropertyKey::Moving => {
                let (moving, hand_control) = self.sdk.is_moving(id)?;
                PropertyValue::Motion {
                    moving,
                    hand_control,
                }
            }
            PropertyKey::Temperature => PropertyValue::Float(self.sdk.temperature(id)?),
            PropertyKey::MaxPosition => {
                let max = self.sdk.max_position(id)?;
                self.scalar(max)
            }
            PropertyKey::Reverse => PropertyValue::Bool(self.sdk.reverse(id)?),
            PropertyKey::Backlash => PropertyValue::Int(self.sdk.backlash(id)?),
            PropertyKey::Target | PropertyKey::Halt => return Err(not_supported),
        })
    }

    fn write(&mut self, id: i32, key: PropertyKey, value: PropertyValue) -> Result<(), i32> {
        let table = classify::table(self.sdk.kind());
        let number = || value.as_f64().ok_or(table.invalid_value);
        match key {
            PropertyKey::Target => self.sdk.move_to(id, number()?),
            PropertyKey::Halt => self.sdk.stop(id),
            PropertyKey::MaxPosition => self.sdk.set_max_position(id, number()?),
            PropertyKey::Reverse => match value {
                PropertyValue::Bool(reverse) => self.sdk.set_reverse(id, reverse),
                _ => Err(table.invalid_value),
            },
            PropertyKey::Backlash => match value {
                PropertyValue::Int(steps) => self.sdk.set_backlash(id, steps),
                _ => Err(table.invalid_value),
            },
            PropertyKey::Position | PropertyKey::Moving | PropertyKey::Temperature => {
                Err(table.not_supported)
            }
        }
    }

    fn enumerate_now(&mut self) -> Result<Vec<BackendId>, BackendError> {
        let kind = self.sdk.kind();
        let ids = self
            .sdk
            .device_ids()
            .map_err(|code| self.error(code, "enumerate"))?;
        self.ids.clear();
        let listed = ids
            .into_iter()
            .map(|id| {
                let backend_id = BackendId(format!("{}-{}", kind, id));
                self.ids.insert(backend_id.clone(), id);
                backend_id
            })
            .collect::<Vec<_>>();
        debug!("{} enumerated {} device(s)", kind, listed.len());
        Ok(listed)
    }

    fn open_now(&mut self, id: &BackendId) -> Result<Handle, BackendError> {
        let table = classify::table(self.sdk.kind());
        let Some(&sdk_id) = self.ids.get(id) else {
            return Err(self.error(table.invalid_id, "open unknown id"));
        };
        self.sdk
            .open(sdk_id)
            .map_err(|code| self.error(code, "open"))?;
        let handle = u64::try_from(sdk_id).map_err(|_| self.error(table.invalid_id, "open"))?;
        debug!("{} opened {}", self.sdk.kind(), id);
        Ok(Handle(handle))
    }

    fn close_now(&mut self, handle: Handle) -> Result<(), BackendError> {
        let id = self.sdk_id(handle)?;
        let closed = self.sdk.close(id);
        closed.map_err(|code| self.error(code, "close"))
    }
}

impl<S: ZwoSdk> Backend for ZwoBackend<S> {
    fn kind(&self) -> BackendKind {
        self.sdk.kind()
    }

    fn enumerate<'a>(&'a mut self) -> BackendFuture<'a, Vec<BackendId>> {
        Box::pin(std::future::ready(self.enumerate_now()))
    }

    fn open<'a>(&'a mut self, id: &'a BackendId) -> BackendFuture<'a, Handle> {
        Box::pin(std::future::ready(self.open_now(id)))
    }

    fn close<'a>(&'a mut self, handle: Handle) -> BackendFuture<'a, ()> {
        Box::pin(std::future::ready(self.close_now(handle)))
    }

    fn read_property<'a>(
        &'a mut self,
        handle: Handle,
        key: PropertyKey,
    ) -> BackendFuture<'a, PropertyValue> {
        let result = self.sdk_id(handle).and_then(|id| {
            let value = self.read(id, key);
            value.map_err(|code| self.error(code, &format!("read {:?}", key)))
        });
        Box::pin(std::future::ready(result))
    }

    fn write_property<'a>(
        &'a mut self,
        handle: Handle,
        key: PropertyKey,
        value: PropertyValue,
    ) -> BackendFuture<'a, ()> {
        let result = self.sdk_id(handle).and_then(|id| {
            let written = self.write(id, key, value);
            written.map_err(|code| self.error(code, &format!("write {:?}", key)))
        });
        Box::pin(std::future::ready(result))
    }
}
