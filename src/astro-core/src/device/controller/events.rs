// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Device event notification.
//!
//! The engine reports connection changes and failed commands to every
//! registered listener. Delivery is fire-and-forget: listeners must not
//! block, and nothing they do feeds back into the tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device::state::ConnectionState;
use crate::device::DeviceId;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    ConnectionOpened,
    ConnectionLost,
    OpenFailed,
    CommandFailed,
    /// The hand controller took over the device.
    HandControl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEvent {
    pub device: DeviceId,
    pub category: EventCategory,
    /// Backend result code, 0 when none applies.
    pub code: i32,
    pub message: String,
}

impl DeviceEvent {
    pub fn new(
        device: DeviceId,
        category: EventCategory,
        code: i32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device,
            category,
            code,
            message: message.into(),
        }
    }
}

/// Trait for components that want to receive device events.
///
/// Both methods default to no-ops so listeners override only what they
/// care about.
pub trait DeviceListener: Send + Sync {
    fn notify(&self, _event: &DeviceEvent) {}

    fn on_connection_change(
        &self,
        _device: &DeviceId,
        _old: ConnectionState,
        _new: ConnectionState,
    ) {
    }
}

/// Manages registered listeners and dispatches events.
pub struct DeviceEventEmitter {
    listeners: Vec<(ListenerId, Arc<dyn DeviceListener>)>,
}

impl Default for DeviceEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Register a listener. The returned id unregisters it.
    pub fn register(&mut self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push((id, listener));
        id
    }

    pub fn unregister(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn notify(&self, event: &DeviceEvent) {
        for (_, listener) in &self.listeners {
            listener.notify(event);
        }
    }

    pub fn notify_connection_change(
        &self,
        device: &DeviceId,
        old: ConnectionState,
        new: ConnectionState,
    ) {
        for (_, listener) in &self.listeners {
            listener.on_connection_change(device, old, new);
        }
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl DeviceListener for TracingListener {
    fn notify(&self, event: &DeviceEvent) {
        match event.category {
            EventCategory::ConnectionOpened => {
                info!("[{}] connection opened: {}", event.device, event.message)
            }
            EventCategory::HandControl => {
                warn!("[{}] device is under hand control", event.device)
            }
            _ => warn!(
                "[{}] {:?} (code {}): {}",
                event.device, event.category, event.code, event.message
            ),
        }
    }

    fn on_connection_change(&self, device: &DeviceId, old: ConnectionState, new: ConnectionState) {
        debug!("[{}] connection {} -> {}", device, old, new);
    }
}

/// Republishes events on a broadcast channel for out-of-process consumers.
/// Lagging receivers lose events; the engine never waits on them.
#[derive(Debug, Clone)]
pub struct BroadcastListener {
    tx: broadcast::Sender<DeviceEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<DeviceEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }
}

impl DeviceListener for BroadcastListener {
    fn notify(&self, event: &DeviceEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EventCategory>>,
        changes: Mutex<Vec<(ConnectionState, ConnectionState)>>,
    }

    impl DeviceListener for Recorder {
        fn notify(&self, event: &DeviceEvent) {
            self.events.lock().unwrap().push(event.category);
        }

        fn on_connection_change(
            &self,
            _device: &DeviceId,
            old: ConnectionState,
            new: ConnectionState,
        ) {
            self.changes.lock().unwrap().push((old, new));
        }
    }

    #[test]
    fn test_register_and_notify() {
        let mut emitter = DeviceEventEmitter::new();
        let recorder = Arc::new(Recorder::default());
        let id = emitter.register(recorder.clone());
        assert_eq!(emitter.listener_count(), 1);

        let device = DeviceId::new("focuser");
        emitter.notify(&DeviceEvent::new(
            device.clone(),
            EventCategory::CommandFailed,
            5,
            "moving",
        ));
        emitter.notify_connection_change(&device, ConnectionState::Open, ConnectionState::Closed);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![EventCategory::CommandFailed]
        );
        assert_eq!(
            *recorder.changes.lock().unwrap(),
            vec![(ConnectionState::Open, ConnectionState::Closed)]
        );

        emitter.unregister(id);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_broadcast_listener() {
        let (listener, mut rx) = BroadcastListener::new(4);
        let event = DeviceEvent::new(
            DeviceId::new("mount"),
            EventCategory::ConnectionLost,
            1,
            "unplugged",
        );
        listener.notify(&event);
        assert_eq!(rx.try_recv().unwrap(), event);
    }
}
