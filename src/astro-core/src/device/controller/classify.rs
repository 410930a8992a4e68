// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Backend result-code classification.
//!
//! Each backend kind owns one static table mapping every code it can
//! return to exactly one class. Adding a backend means adding a table.

use crate::backend::{BackendError, BackendKind};
use crate::device::response::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalidate the connection.
    Fatal,
    /// Keep the connection, surface to the caller.
    Transient,
    /// Ignore.
    Benign,
}

#[derive(Debug, Clone, Copy)]
pub struct CodeEntry {
    pub code: i32,
    pub name: &'static str,
    pub class: ErrorClass,
    /// Caller-facing error for this code.
    pub surface: fn(String) -> DeviceError,
}

/// Per-backend code table plus the codes the engine synthesizes itself.
#[derive(Debug)]
pub struct CodeTable {
    pub entries: &'static [CodeEntry],
    pub timeout: i32,
    pub not_supported: i32,
    pub removed: i32,
    pub invalid_id: i32,
    pub closed: i32,
    pub invalid_value: i32,
}

macro_rules! code {
    ($code:expr, $name:expr, $class:ident, $surface:ident) => {
        CodeEntry {
            code: $code,
            name: $name,
            class: ErrorClass::$class,
            surface: DeviceError::$surface,
        }
    };
}

static EAF_CODES: [CodeEntry; 10] = [
    code!(0, "EAF_SUCCESS", Benign, HardwareBusy),
    code!(1, "EAF_ERROR_INVALID_INDEX", Transient, InvalidRequest),
    code!(2, "EAF_ERROR_INVALID_ID", Fatal, ConnectionLost),
    code!(3, "EAF_ERROR_INVALID_VALUE", Transient, InvalidRequest),
    code!(4, "EAF_ERROR_REMOVED", Fatal, ConnectionLost),
    code!(5, "EAF_ERROR_MOVING", Transient, HardwareBusy),
    code!(6, "EAF_ERROR_ERROR_STATE", Transient, HardwareBusy),
    code!(7, "EAF_ERROR_GENERAL_ERROR", Transient, HardwareBusy),
    code!(8, "EAF_ERROR_NOT_SUPPORTED", Transient, NotSupported),
    code!(9, "EAF_ERROR_CLOSED", Fatal, ConnectionLost),
];

static CAA_CODES: [CodeEntry; 15] = [
    code!(0, "CAA_SUCCESS", Benign, HardwareBusy),
    code!(1, "CAA_ERROR_INVALID_INDEX", Transient, InvalidRequest),
    code!(2, "CAA_ERROR_INVALID_ID", Fatal, ConnectionLost),
    code!(3, "CAA_ERROR_INVALID_VALUE", Transient, InvalidRequest),
    code!(4, "CAA_ERROR_REMOVED", Fatal, ConnectionLost),
    code!(5, "CAA_ERROR_MOVING", Transient, HardwareBusy),
    code!(6, "CAA_ERROR_ERROR_STATE", Transient, HardwareBusy),
    code!(7, "CAA_ERROR_GENERAL_ERROR", Transient, HardwareBusy),
    code!(8, "CAA_ERROR_NOT_SUPPORTED", Transient, NotSupported),
    code!(9, "CAA_ERROR_CLOSED", Fatal, ConnectionLost),
    code!(10, "CAA_ERROR_OUT_RANGE", Transient, InvalidRequest),
    code!(11, "CAA_ERROR_OVER_LIMIT", Transient, InvalidRequest),
    code!(12, "CAA_ERROR_STALL", Transient, HardwareBusy),
    code!(13, "CAA_ERROR_TIMEOUT", Transient, Timeout),
    code!(14, "CAA_ERROR_END", Transient, HardwareBusy),
];

/// Codes raised by the serial mount backend; the wire itself has none.
static IOPTRON_CODES: [CodeEntry; 9] = [
    code!(0, "IOPTRON_OK", Benign, HardwareBusy),
    code!(1, "IOPTRON_DEVICE_REMOVED", Fatal, ConnectionLost),
    code!(2, "IOPTRON_INVALID_PORT", Fatal, ConnectionLost),
    code!(3, "IOPTRON_PORT_CLOSED", Fatal, ConnectionLost),
    code!(4, "IOPTRON_IO_ERROR", Transient, ProtocolViolation),
    code!(5, "IOPTRON_TIMEOUT", Transient, Timeout),
    code!(6, "IOPTRON_REJECTED", Transient, HardwareBusy),
    code!(7, "IOPTRON_INVALID_ARGUMENT", Transient, InvalidRequest),
    code!(8, "IOPTRON_NOT_SUPPORTED", Transient, NotSupported),
];

/// Raised by the adapter when a backend call outlives its deadline. No SDK
/// or serial backend returns negative codes.
pub const CALL_TIMEOUT: i32 = -1;

static CALL_TIMEOUT_ENTRY: CodeEntry = code!(CALL_TIMEOUT, "CALL_TIMEOUT", Transient, Timeout);

static EAF_TABLE: CodeTable = CodeTable {
    entries: &EAF_CODES,
    timeout: CALL_TIMEOUT,
    not_supported: 8,
    removed: 4,
    invalid_id: 2,
    closed: 9,
    invalid_value: 3,
};

static CAA_TABLE: CodeTable = CodeTable {
    entries: &CAA_CODES,
    timeout: CALL_TIMEOUT,
    not_supported: 8,
    removed: 4,
    invalid_id: 2,
    closed: 9,
    invalid_value: 3,
};

static IOPTRON_TABLE: CodeTable = CodeTable {
    entries: &IOPTRON_CODES,
    timeout: CALL_TIMEOUT,
    not_supported: 8,
    removed: 1,
    invalid_id: 2,
    closed: 3,
    invalid_value: 7,
};

/// Serial mount result codes, for the backend that raises them.
pub mod ioptron {
    pub const OK: i32 = 0;
    pub const DEVICE_REMOVED: i32 = 1;
    pub const INVALID_PORT: i32 = 2;
    pub const PORT_CLOSED: i32 = 3;
    pub const IO_ERROR: i32 = 4;
    pub const TIMEOUT: i32 = 5;
    pub const REJECTED: i32 = 6;
    pub const INVALID_ARGUMENT: i32 = 7;
    pub const NOT_SUPPORTED: i32 = 8;
}

pub fn table(kind: BackendKind) -> &'static CodeTable {
    match kind {
        BackendKind::ZwoEaf => &EAF_TABLE,
        BackendKind::ZwoCaa => &CAA_TABLE,
        BackendKind::IOptron => &IOPTRON_TABLE,
    }
}

fn lookup(kind: BackendKind, code: i32) -> Option<&'static CodeEntry> {
    if code == CALL_TIMEOUT {
        return Some(&CALL_TIMEOUT_ENTRY);
    }
    table(kind).entries.iter().find(|entry| entry.code == code)
}

/// Whether a failed call means the device did not answer in time, either
/// by its own report or by the adapter deadline.
pub fn is_timeout(kind: BackendKind, code: i32) -> bool {
    lookup(kind, code).is_some_and(|entry| {
        matches!((entry.surface)(String::new()), DeviceError::Timeout(_))
    })
}

/// Pure mapping from (backend kind, code) to a class.
/// Unmapped codes are `Transient`: an unknown code never drops a connection.
pub fn classify(kind: BackendKind, code: i32) -> ErrorClass {
    lookup(kind, code)
        .map(|entry| entry.class)
        .unwrap_or(ErrorClass::Transient)
}

pub fn code_name(kind: BackendKind, code: i32) -> &'static str {
    lookup(kind, code).map(|entry| entry.name).unwrap_or("UNKNOWN")
}

/// Caller-facing error for a failed backend call.
pub fn to_device_error(kind: BackendKind, err: &BackendError) -> DeviceError {
    let message = format!("{} ({})", err.message, code_name(kind, err.code));
    match lookup(kind, err.code) {
        Some(entry) if entry.class == ErrorClass::Fatal => DeviceError::ConnectionLost(message),
        Some(entry) => (entry.surface)(message),
        None => DeviceError::HardwareBusy(message),
    }
}
