// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::Serialize;
use thiserror::Error;

/// Definite failure outcome of a device request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", content = "message")]
pub enum DeviceError {
    #[error("not connected: {0}")]
    ConnectionLost(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("hardware busy: {0}")]
    HardwareBusy(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::Timeout(_) | Self::HardwareBusy(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::ProtocolViolation(_) => "ProtocolViolation",
            Self::Timeout(_) => "Timeout",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::HardwareBusy(_) => "HardwareBusy",
            Self::NotSupported(_) => "NotSupported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_string(&DeviceError::Timeout("move".into())).unwrap();
        assert_eq!(json, r#"{"kind":"Timeout","message":"move"}"#);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(DeviceError::HardwareBusy("moving".into()).is_transient());
        assert!(!DeviceError::InvalidRequest("nan".into()).is_transient());
    }
}
