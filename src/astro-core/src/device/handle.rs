// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Property-serving handle to one running device engine.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::device::command::DeviceCommand;
use crate::device::controller::handlers::validate;
use crate::device::request::{CommandTicket, DeviceRequest};
use crate::device::response::{DeviceError, DeviceResult};
use crate::device::state::PropertySnapshot;
use crate::device::{DeviceId, DeviceInfo};

/// A cloneable handle to a single device engine.
///
/// Snapshot reads never wait on the engine: they see the last committed
/// tick. Requests are validated here first so invalid ones are refused
/// without reaching the queue.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    info: Arc<DeviceInfo>,
    /// Send requests to the engine.
    tx: mpsc::Sender<DeviceRequest>,
    /// Latest committed snapshot.
    state_rx: watch::Receiver<PropertySnapshot>,
    /// Wakes the device task so a request is picked up before the next
    /// scheduled tick.
    wake: Arc<Notify>,
}

impl DeviceHandle {
    pub(crate) fn new(
        info: Arc<DeviceInfo>,
        tx: mpsc::Sender<DeviceRequest>,
        state_rx: watch::Receiver<PropertySnapshot>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            info,
            tx,
            state_rx,
            wake,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn snapshot(&self) -> PropertySnapshot {
        self.state_rx.borrow().clone()
    }

    /// Receiver that changes whenever a tick commits new values.
    pub fn subscribe(&self) -> watch::Receiver<PropertySnapshot> {
        self.state_rx.clone()
    }

    /// Submit a request. `Ok` means accepted; the ticket carries the
    /// outcome.
    pub fn request(&self, cmd: DeviceCommand) -> DeviceResult<CommandTicket> {
        {
            let snapshot = self.state_rx.borrow();
            validate(&cmd, &(self.info.as_ref(), &*snapshot)).into_result()?;
        }
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .try_send(DeviceRequest { cmd, respond_to })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    DeviceError::HardwareBusy("request channel full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    DeviceError::ConnectionLost("device task stopped".into())
                }
            })?;
        self.wake.notify_one();
        Ok(CommandTicket::new(rx))
    }

    pub fn request_move(&self, target: f64) -> DeviceResult<CommandTicket> {
        self.request(DeviceCommand::Move { target })
    }

    pub fn request_halt(&self) -> DeviceResult<CommandTicket> {
        self.request(DeviceCommand::Halt)
    }
}
