// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod backend;
pub mod device;
pub mod math;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use backend::{Adapter, Backend, BackendError, BackendId, BackendKind, Handle};
pub use device::command::{Command, CommandClass, CommandKind, DeviceCommand};
pub use device::controller::{DeviceEngine, DeviceListener, EventCategory};
pub use device::handle::DeviceHandle;
pub use device::request::{CommandTicket, DeviceRequest};
pub use device::response::{DeviceError, DeviceResult};
pub use device::state::{ConnectionState, PropertyDelta, PropertySnapshot};
pub use device::{Capabilities, DeviceId, DeviceInfo, DeviceKind, DeviceSettings};
