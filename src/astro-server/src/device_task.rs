// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-device task: drives one `DeviceEngine` until shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info};

use astro_core::device::controller::DeviceListener;
use astro_core::{Adapter, DeviceEngine, DeviceHandle, DeviceInfo, DeviceSettings};

/// Everything needed to start one device task.
pub struct DeviceTaskConfig {
    pub info: DeviceInfo,
    pub settings: DeviceSettings,
    pub adapter: Arc<Adapter>,
    pub listeners: Vec<Arc<dyn DeviceListener>>,
}

/// Build the engine for a device. The handle is the only way in once the
/// engine moves into its task.
pub fn build_engine(config: DeviceTaskConfig) -> (DeviceEngine, DeviceHandle) {
    let (mut engine, handle) = DeviceEngine::new(config.info, config.settings, config.adapter);
    for listener in config.listeners {
        engine.register_listener(listener);
    }
    (engine, handle)
}

/// Tick the engine, sleeping for its delay hint in between. Requests cut
/// the sleep short. On shutdown the device is closed and outstanding
/// requests fail.
pub async fn run_device_task(mut engine: DeviceEngine, mut shutdown_rx: watch::Receiver<bool>) {
    let wake = engine.wake();
    let id = engine.info().id.clone();
    info!(
        "[{}] device task started ({} {} via {})",
        id,
        engine.info().manufacturer,
        engine.info().model,
        engine.info().backend
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let delay = engine.tick().await;
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = wake.notified() => {
                debug!("[{}] woken by request", id);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    engine.shutdown().await;
    info!("[{}] device task stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use astro_backend::sim::SimZwoSdk;
    use astro_backend::zwo::ZwoBackend;
    use astro_core::device::controller::BroadcastListener;
    use astro_core::{BackendKind, ConnectionState, EventCategory};

    fn focuser(devices: usize) -> DeviceTaskConfig {
        let sdk = SimZwoSdk::new(BackendKind::ZwoEaf, devices);
        let adapter = Adapter::new("sim-eaf", Box::new(ZwoBackend::new(sdk)), Duration::from_secs(1));
        DeviceTaskConfig {
            info: DeviceInfo::new("focuser", BackendKind::ZwoEaf, 0),
            settings: DeviceSettings::default(),
            adapter: Arc::new(adapter),
            listeners: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_serves_requests_until_shutdown() {
        let (events, mut events_rx) = BroadcastListener::new(16);
        let mut config = focuser(1);
        config.listeners.push(Arc::new(events));
        let (engine, handle) = build_engine(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_device_task(engine, shutdown_rx));

        let mut snapshots = handle.subscribe();
        time::timeout(Duration::from_secs(10), async {
            while !snapshots.borrow_and_update().is_open() {
                snapshots.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        let opened = events_rx.recv().await.unwrap();
        assert_eq!(opened.category, EventCategory::ConnectionOpened);

        handle.request_move(3000.0).unwrap().wait().await.unwrap();
        time::timeout(Duration::from_secs(60), async {
            while snapshots.borrow_and_update().position != Some(3000.0) {
                snapshots.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(handle.snapshot().connection, ConnectionState::Closed);
        assert!(handle.request_move(100.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_to_reopen() {
        let (engine, handle) = build_engine(focuser(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_device_task(engine, shutdown_rx));

        time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.snapshot().is_open());

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.snapshot().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_shutdown_sender_stops_task() {
        let (engine, _handle) = build_engine(focuser(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_device_task(engine, shutdown_rx));
        time::sleep(Duration::from_millis(100)).await;

        drop(shutdown_tx);
        time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
