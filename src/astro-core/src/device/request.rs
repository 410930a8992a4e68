// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use tokio::sync::oneshot;

use crate::device::command::DeviceCommand;
use crate::device::response::{DeviceError, DeviceResult};

/// Request sent to the device engine.
#[derive(Debug)]
pub struct DeviceRequest {
    pub cmd: DeviceCommand,
    pub respond_to: oneshot::Sender<DeviceResult<()>>,
}

/// Receipt for an accepted request; resolves exactly once.
#[derive(Debug)]
pub struct CommandTicket {
    rx: oneshot::Receiver<DeviceResult<()>>,
}

impl CommandTicket {
    pub fn new(rx: oneshot::Receiver<DeviceResult<()>>) -> Self {
        Self { rx }
    }

    /// Wait for the outcome. A dropped engine reads as a lost connection.
    pub async fn wait(self) -> DeviceResult<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(DeviceError::ConnectionLost("device task stopped".into())))
    }

    /// Non-blocking check; `None` while the command is still pending.
    pub fn try_result(&mut self) -> Option<DeviceResult<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DeviceError::ConnectionLost(
                "device task stopped".into(),
            ))),
        }
    }
}
