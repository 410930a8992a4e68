// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Backend capability consumed by the device engine.
//!
//! A backend is the vendor SDK binding or serial line a device talks
//! through. Every call returns a backend-specific numeric result code on
//! failure; the engine hands those codes to the error classifier.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::device::controller::classify;

/// Alias to reduce type complexity in `Backend`.
pub type BackendFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Family of backend, selects the result-code table and frame layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    ZwoEaf,
    ZwoCaa,
    #[serde(rename = "ioptron")]
    IOptron,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ZwoEaf => "zwo-eaf",
            Self::ZwoCaa => "zwo-caa",
            Self::IOptron => "ioptron",
        }
    }

    /// Line-oriented backends exchange terminated text frames over
    /// send/receive instead of typed property calls.
    pub fn is_line_oriented(&self) -> bool {
        matches!(self, Self::IOptron)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Enumerated backend identifier. Not stable across hot-plug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId(pub String);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Open handle returned by `Backend::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

/// Failed backend call with its numeric result code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backend code {code}: {message}")]
pub struct BackendError {
    pub code: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result of a non-blocking receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Bytes(Vec<u8>),
    WouldBlock,
}

/// Typed property addressed by `read_property` / `write_property`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKey {
    Position,
    /// Writing starts a move; not readable on every backend.
    Target,
    Moving,
    Halt,
    Temperature,
    MaxPosition,
    Reverse,
    Backlash,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Motion { moving: bool, hand_control: bool },
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Motion { moving, .. } => Some(*moving),
            _ => None,
        }
    }
}

/// Transport-level capability every device backend provides.
///
/// SDK-style backends implement the property calls and leave
/// `send`/`receive` at their defaults; line-oriented backends do the
/// opposite.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    fn enumerate<'a>(&'a mut self) -> BackendFuture<'a, Vec<BackendId>>;

    fn open<'a>(&'a mut self, id: &'a BackendId) -> BackendFuture<'a, Handle>;

    fn close<'a>(&'a mut self, handle: Handle) -> BackendFuture<'a, ()>;

    fn send<'a>(&'a mut self, _handle: Handle, _payload: &'a [u8]) -> BackendFuture<'a, ()> {
        Box::pin(std::future::ready(Err(BackendError::new(
            classify::table(self.kind()).not_supported,
            "send",
        ))))
    }

    fn receive<'a>(&'a mut self, _handle: Handle) -> BackendFuture<'a, Received> {
        Box::pin(std::future::ready(Err(BackendError::new(
            classify::table(self.kind()).not_supported,
            "receive",
        ))))
    }

    fn read_property<'a>(
        &'a mut self,
        _handle: Handle,
        key: PropertyKey,
    ) -> BackendFuture<'a, PropertyValue> {
        Box::pin(std::future::ready(Err(BackendError::new(
            classify::table(self.kind()).not_supported,
            format!("read {:?}", key),
        ))))
    }

    fn write_property<'a>(
        &'a mut self,
        _handle: Handle,
        key: PropertyKey,
        _value: PropertyValue,
    ) -> BackendFuture<'a, ()> {
        Box::pin(std::future::ready(Err(BackendError::new(
            classify::table(self.kind()).not_supported,
            format!("write {:?}", key),
        ))))
    }
}

/// One physical adapter, possibly shared by several devices.
///
/// The backend sits behind an adapter-owned lock taken for exactly one
/// backend call, so devices on the same SDK handle table serialize while
/// devices on different adapters never contend. Every call is bounded by
/// `call_timeout`; expiry maps to the backend's timeout code.
pub struct Adapter {
    name: String,
    kind: BackendKind,
    call_timeout: Duration,
    inner: Mutex<Box<dyn Backend>>,
    calls: AtomicU64,
}

impl Adapter {
    pub fn new(name: impl Into<String>, backend: Box<dyn Backend>, call_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            kind: backend.kind(),
            call_timeout,
            inner: Mutex::new(backend),
            calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Number of backend calls issued through this adapter.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn enumerate(&self) -> Result<Vec<BackendId>, BackendError> {
        let mut backend = self.inner.lock().await;
        self.bounded(backend.enumerate()).await
    }

    pub async fn open(&self, id: &BackendId) -> Result<Handle, BackendError> {
        let mut backend = self.inner.lock().await;
        self.bounded(backend.open(id)).await
    }

    pub async fn close(&self, handle: Handle) -> Result<(), BackendError> {
        let mut backend = self.inner.lock().await;
        self.bounded(backend.close(handle)).await
    }

    pub async fn send(&self, handle: Handle, payload: &[u8]) -> Result<(), BackendError> {
        let mut backend = self.inner.lock().await;
        self.bounded(backend.send(handle, payload)).await
    }

    pub async fn receive(&self, handle: Handle) -> Result<Received, BackendError> {
        let mut backend = self.inner.lock().await;
        self.bounded(backend.receive(handle)).await
    }

    pub async fn read_property(
        &self,
        handle: Handle,
        key: PropertyKey,
    ) -> Result<PropertyValue, BackendError> {
        let mut backend = self.inner.lock().await;
        self.bounded(backend.read_property(handle, key)).await
    }

    pub async fn write_property(
        &self,
        handle: Handle,
        key: PropertyKey,
        value: PropertyValue,
    ) -> Result<(), BackendError> {
        let mut backend = self.inner.lock().await;
        self.bounded(backend.write_property(handle, key, value)).await
    }

    async fn bounded<T>(&self, call: BackendFuture<'_, T>) -> Result<T, BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::new(
                classify::table(self.kind).timeout,
                format!("{} call exceeded {:?}", self.name, self.call_timeout),
            )),
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowBackend;

    impl Backend for SlowBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::ZwoCaa
        }

        fn enumerate<'a>(&'a mut self) -> BackendFuture<'a, Vec<BackendId>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(vec![])
            })
        }

        fn open<'a>(&'a mut self, _id: &'a BackendId) -> BackendFuture<'a, Handle> {
            Box::pin(async { Ok(Handle(1)) })
        }

        fn close<'a>(&'a mut self, _handle: Handle) -> BackendFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_call_timeout_maps_to_backend_timeout_code() {
        tokio::time::pause();
        let adapter = Adapter::new("slow", Box::new(SlowBackend), Duration::from_millis(200));
        let err = adapter.enumerate().await.unwrap_err();
        assert_eq!(err.code, classify::table(BackendKind::ZwoCaa).timeout);
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_default_send_is_not_supported() {
        let adapter = Adapter::new("slow", Box::new(SlowBackend), Duration::from_millis(200));
        let err = adapter.send(Handle(1), b":Q#").await.unwrap_err();
        assert_eq!(err.code, classify::table(BackendKind::ZwoCaa).not_supported);
    }

    #[test]
    fn test_property_value_conversions() {
        assert_eq!(PropertyValue::Int(42).as_f64(), Some(42.0));
        assert_eq!(
            PropertyValue::Motion {
                moving: true,
                hand_control: false
            }
            .as_bool(),
            Some(true)
        );
        assert_eq!(PropertyValue::Bool(true).as_f64(), None);
    }
}
