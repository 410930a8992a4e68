// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-device tick engine.
//!
//! One `DeviceEngine` owns everything mutable about a device: connection,
//! command queue and the working snapshot. Each `tick` runs, in order:
//!
//! 1. `ensure_open`: reopen and hydrate when the device is not `Open`.
//! 2. `drain_due`: one reply poll or one dispatch.
//! 3. Low-frequency polls (temperature), only while the queue is idle.
//! 4. Commit: apply the tick's delta once and publish the snapshot.
//!
//! Backend errors never escape a tick. They reopen the device, fail the
//! command that hit them, or are logged and dropped, depending on class.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{Adapter, BackendError, BackendId, BackendKind, Handle, PropertyKey, PropertyValue, Received};
use crate::device::command::{Command, CommandKind, DeviceCommand, Exchange, FrameLayout, ReplyShape};
use crate::device::handle::DeviceHandle;
use crate::device::request::DeviceRequest;
use crate::device::response::{DeviceError, DeviceResult};
use crate::device::state::{ConnectionState, PollClass, PropertyDelta, PropertySnapshot};
use crate::device::{DeviceInfo, DeviceKind, DeviceSettings};

use super::classify::{self, classify, to_device_error, ErrorClass};
use super::events::{DeviceEvent, DeviceEventEmitter, DeviceListener, EventCategory, ListenerId};
use super::handlers::{commands_for, coordinate_fallback, hydration_keys, periodic_commands, validate};
use super::lifecycle::ConnectionManager;
use super::parser::{parse, Payload, FRAME_TERMINATOR, MAX_FRAME_LEN};
use super::queue::{CommandQueue, QueueState};

/// Shortest delay hint while the device is closed.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Longest delay hint while open; requests wake the task sooner.
const IDLE_CEILING: Duration = Duration::from_secs(60);

struct OpenFailure {
    id: Option<BackendId>,
    error: BackendError,
    /// The handle was open and hydration hit a fatal code.
    lost: bool,
}

/// Reply bytes checked against the expected shape.
enum Assembled {
    Pending,
    Ack(bool),
    Frame(FrameLayout, Vec<u8>),
    Garbled(String),
}

fn assemble(reply: ReplyShape, rx: &[u8]) -> Assembled {
    match reply {
        ReplyShape::NoReply => Assembled::Ack(true),
        ReplyShape::Ack => match rx.first() {
            None => Assembled::Pending,
            Some(b'1') => Assembled::Ack(true),
            Some(b'0') => Assembled::Ack(false),
            Some(other) => Assembled::Garbled(format!("unexpected ack byte 0x{:02x}", other)),
        },
        ReplyShape::Frame(layout) => match rx.iter().position(|b| *b == FRAME_TERMINATOR) {
            Some(end) => Assembled::Frame(layout, rx[..=end].to_vec()),
            None if rx.len() > MAX_FRAME_LEN => {
                Assembled::Garbled(format!("{} bytes without terminator", rx.len()))
            }
            None => Assembled::Pending,
        },
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Snapshot changes a successful write implies before the next poll.
fn written(kind: CommandKind, key: PropertyKey, value: PropertyValue) -> PropertyDelta {
    let mut delta = PropertyDelta::default();
    match key {
        PropertyKey::Target => {
            if let CommandKind::Move { target } = kind {
                delta.target_position = Some(target);
                delta.moving = Some(true);
            }
        }
        PropertyKey::Reverse => delta.reverse = value.as_bool(),
        PropertyKey::MaxPosition => delta.max_position = value.as_f64(),
        PropertyKey::Backlash => {
            if let PropertyValue::Int(steps) = value {
                delta.backlash = Some(steps);
            }
        }
        _ => {}
    }
    delta
}

pub struct DeviceEngine {
    info: Arc<DeviceInfo>,
    settings: DeviceSettings,
    adapter: Arc<Adapter>,
    connection: ConnectionManager,
    queue: CommandQueue,
    requests: mpsc::Receiver<DeviceRequest>,
    snapshot_tx: watch::Sender<PropertySnapshot>,
    /// Working copy; published whole at the end of each tick.
    snapshot: PropertySnapshot,
    emitter: DeviceEventEmitter,
    last_poll: HashMap<PollClass, Instant>,
    /// Last temperature read issued, answered or not.
    temperature_attempt: Option<Instant>,
    consecutive_timeouts: u32,
    wake: Arc<Notify>,
}

impl DeviceEngine {
    pub fn new(info: DeviceInfo, settings: DeviceSettings, adapter: Arc<Adapter>) -> (Self, DeviceHandle) {
        let info = Arc::new(info);
        let mut snapshot = PropertySnapshot::new(info.is_angular());
        snapshot.min_position = settings
            .min_position
            .or((info.kind == DeviceKind::Focuser).then_some(0.0));
        snapshot.max_position = settings.max_position;

        let mut queue = CommandQueue::new(settings.queue_capacity);
        for command in periodic_commands(info.backend, settings.command_timeout) {
            queue.enqueue(command);
        }

        let (tx, requests) = mpsc::channel(settings.queue_capacity.max(1));
        let (snapshot_tx, state_rx) = watch::channel(snapshot.clone());
        let wake = Arc::new(Notify::new());
        let handle = DeviceHandle::new(info.clone(), tx, state_rx, wake.clone());

        let connection = ConnectionManager::new(info.backend, settings.reopen.clone());
        let engine = Self {
            info,
            connection,
            settings,
            adapter,
            queue,
            requests,
            snapshot_tx,
            snapshot,
            emitter: DeviceEventEmitter::new(),
            last_poll: HashMap::new(),
            temperature_attempt: None,
            consecutive_timeouts: 0,
            wake,
        };
        (engine, handle)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Last committed snapshot.
    pub fn snapshot(&self) -> PropertySnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Last successful poll of a property class.
    pub fn last_poll(&self, class: PollClass) -> Option<Instant> {
        self.last_poll.get(&class).copied()
    }

    /// Notified whenever a request is submitted through a handle.
    pub fn wake(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn register_listener(&mut self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        self.emitter.register(listener)
    }

    pub fn unregister_listener(&mut self, id: ListenerId) {
        self.emitter.unregister(id);
    }

    /// Run one scheduling step and return a hint for the next one.
    pub async fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let previous = self.snapshot_tx.borrow().connection;
        let mut delta = PropertyDelta::default();

        let open = self.ensure_open(now).await;
        self.drain_requests();
        if open {
            self.drain_due(now, &mut delta).await;
            self.poll_low_frequency(now);
        }
        self.commit(delta, previous);
        self.next_delay(Instant::now())
    }

    /// Stop for good: refuse further requests, fail outstanding ones and
    /// close the backend handle. The final snapshot is published `Closed`.
    pub async fn shutdown(&mut self) {
        let previous = self.snapshot_tx.borrow().connection;
        let reason = DeviceError::ConnectionLost("device shutting down".into());

        self.requests.close();
        while let Ok(DeviceRequest { respond_to, .. }) = self.requests.try_recv() {
            let _ = respond_to.send(Err(reason.clone()));
        }
        let failed = self.queue.fail_all(reason);
        if let Some(handle) = self.connection.invalidate(Instant::now()) {
            if let Err(e) = self.adapter.close(handle).await {
                debug!("[{}] close on shutdown: {}", self.info.id, e);
            }
        }
        debug!("[{}] shut down, {} command(s) failed", self.info.id, failed);
        self.commit(PropertyDelta::default(), previous);
    }

    /// Open the device if needed. Returns whether it is open. No backend
    /// call happens when it already is.
    async fn ensure_open(&mut self, now: Instant) -> bool {
        if self.connection.is_open() {
            return true;
        }
        if !self.connection.attempt_due(now) {
            return false;
        }
        self.connection.begin_attempt();
        self.snapshot.connection = self.connection.state();

        match self.open_device().await {
            Ok((id, handle, hydrated)) => {
                self.connection.opened(id.clone(), handle, now);
                self.queue
                    .clear_in_flight(DeviceError::ConnectionLost("stale command".into()), now);
                self.queue.arm_periodic(now);
                self.consecutive_timeouts = 0;
                self.snapshot.comm_errors = 0;
                self.snapshot.last_error = None;
                if hydrated.temperature_c.is_some() {
                    self.last_poll.insert(PollClass::Temperature, now);
                    self.temperature_attempt = Some(now);
                }
                if hydrated.position.is_some() {
                    self.last_poll.insert(PollClass::Status, now);
                }
                // Requests drained in this tick validate against fresh values.
                self.snapshot
                    .apply(hydrated, unix_ms(), self.settings.temperature_log_len);
                self.snapshot.connection = self.connection.state();
                self.emit(
                    EventCategory::ConnectionOpened,
                    0,
                    format!("{} opened as {} ({:?})", self.info.name, id, handle),
                );
                true
            }
            Err(failure) => {
                if failure.lost {
                    self.connection.lost_while_opening(failure.id, &failure.error, now);
                } else {
                    self.connection.failed(failure.id, &failure.error, now);
                }
                self.snapshot.connection = self.connection.state();
                debug!(
                    "[{}] open failed, next attempt in {:?}",
                    self.info.id,
                    self.connection.retry_delay(now)
                );
                self.emit(
                    EventCategory::OpenFailed,
                    failure.error.code,
                    format!(
                        "{} ({})",
                        failure.error.message,
                        classify::code_name(self.info.backend, failure.error.code)
                    ),
                );
                false
            }
        }
    }

    /// Enumerate, resolve the backend id for our index, open and hydrate.
    async fn open_device(&self) -> Result<(BackendId, Handle, PropertyDelta), OpenFailure> {
        let kind = self.info.backend;
        let ids = self
            .adapter
            .enumerate()
            .await
            .map_err(|error| OpenFailure {
                id: None,
                error,
                lost: false,
            })?;
        let id = ids.get(self.info.index).cloned().ok_or_else(|| OpenFailure {
            id: None,
            error: BackendError::new(
                classify::table(kind).removed,
                format!("no device at index {} ({} found)", self.info.index, ids.len()),
            ),
            lost: false,
        })?;
        let handle = self.adapter.open(&id).await.map_err(|error| OpenFailure {
            id: Some(id.clone()),
            error,
            lost: false,
        })?;

        let mut delta = PropertyDelta::default();
        for key in hydration_keys(kind) {
            match self.adapter.read_property(handle, *key).await {
                Ok(value) => match parse(kind, &Payload::Value(*key, value)) {
                    Ok(parsed) => delta.merge(parsed),
                    Err(e) => debug!("[{}] hydration of {:?}: {}", self.info.id, key, e),
                },
                Err(error) if classify(kind, error.code) == ErrorClass::Fatal => {
                    if let Err(e) = self.adapter.close(handle).await {
                        debug!("[{}] close after failed hydration: {}", self.info.id, e);
                    }
                    return Err(OpenFailure {
                        id: Some(id),
                        error,
                        lost: true,
                    });
                }
                Err(error) => debug!("[{}] hydration of {:?}: {}", self.info.id, key, error),
            }
        }
        if kind == BackendKind::ZwoCaa && delta.max_position.is_none() {
            delta.max_position = Some(360.0);
        }
        if let (Some(limit), Some(device_max)) = (self.settings.max_position, delta.max_position) {
            delta.max_position = Some(device_max.min(limit));
        }
        Ok((id, handle, delta))
    }

    /// Mark the device closed after a fatal code. Snapshot values are kept.
    async fn invalidate(&mut self, code: i32, message: String, now: Instant) {
        let failed = self
            .queue
            .fail_all(DeviceError::ConnectionLost(message.clone()));
        if let Some(handle) = self.connection.invalidate(now) {
            if let Err(e) = self.adapter.close(handle).await {
                debug!("[{}] close after invalidation: {}", self.info.id, e);
            }
        }
        self.consecutive_timeouts = 0;
        self.snapshot.connection = self.connection.state();
        debug!("[{}] invalidated, {} command(s) failed", self.info.id, failed);
        self.emit(EventCategory::ConnectionLost, code, message);
    }

    fn drain_requests(&mut self) {
        while let Ok(DeviceRequest { cmd, respond_to }) = self.requests.try_recv() {
            let ctx = (self.info.as_ref(), &self.snapshot);
            let verdict = validate(&cmd, &ctx);
            if !verdict.is_ok() {
                let _ = respond_to.send(verdict.into_result());
                continue;
            }
            if let DeviceCommand::Move { target } = cmd {
                if self.is_no_op_move(CommandKind::Move { target }) {
                    debug!("[{}] move to {} already in position", self.info.id, target);
                    let _ = respond_to.send(Ok(()));
                    continue;
                }
            }
            let commands = commands_for(&cmd, &ctx, self.settings.command_timeout);
            if !self.queue.enqueue_request(commands, respond_to) {
                debug!("[{}] {} refused, queue full", self.info.id, cmd.name());
            }
        }
    }

    /// A move the device is already at.
    fn is_no_op_move(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Move { target } => !self.snapshot.moving && self.within_tolerance(target),
            _ => false,
        }
    }

    fn within_tolerance(&self, target: f64) -> bool {
        let target = if self.info.is_angular() {
            crate::math::normalize_degrees(target)
        } else {
            target
        };
        self.snapshot
            .distance_to(target)
            .is_some_and(|d| d <= self.settings.position_tolerance)
    }

    /// One reply poll while a command is outstanding, otherwise one
    /// dispatch. Commands resolved without backend I/O do not count.
    async fn drain_due(&mut self, now: Instant, delta: &mut PropertyDelta) {
        if self.queue.state() == QueueState::Sent {
            self.poll_reply(now, delta).await;
            return;
        }
        loop {
            let Some(handle) = self.connection.handle() else {
                return;
            };
            let Some(in_flight) = self.queue.start_next(now) else {
                return;
            };
            let kind = in_flight.command.kind;
            let exchange = in_flight.command.exchange.clone();
            match exchange {
                Exchange::Local => {
                    let outcome = self.resolve_local(kind, delta);
                    self.resolve(outcome, now, delta);
                }
                Exchange::Write(PropertyKey::Target, _) if self.is_no_op_move(kind) => {
                    self.resolve(Ok(()), now, delta);
                }
                Exchange::Read(key) => {
                    match self.adapter.read_property(handle, key).await {
                        Ok(value) => match parse(self.info.backend, &Payload::Value(key, value)) {
                            Ok(parsed) => {
                                if kind == CommandKind::PollTemperature {
                                    self.last_poll.insert(PollClass::Temperature, now);
                                } else {
                                    self.last_poll.insert(PollClass::Status, now);
                                }
                                delta.merge(parsed);
                                self.resolve(Ok(()), now, delta);
                            }
                            Err(e) => {
                                self.snapshot.comm_errors += 1;
                                self.resolve(Err(DeviceError::ProtocolViolation(e.to_string())), now, delta);
                            }
                        },
                        Err(error) => self.backend_failure(error, now, delta).await,
                    }
                    return;
                }
                Exchange::Write(key, value) => {
                    match self.adapter.write_property(handle, key, value).await {
                        Ok(()) => {
                            delta.merge(written(kind, key, value));
                            self.resolve(Ok(()), now, delta);
                        }
                        Err(error) => self.backend_failure(error, now, delta).await,
                    }
                    return;
                }
                Exchange::Wire { payload, reply } => {
                    match self.adapter.send(handle, &payload).await {
                        Ok(()) if reply == ReplyShape::NoReply => self.resolve(Ok(()), now, delta),
                        // Stays `Sent` until the reply is assembled or expires.
                        Ok(()) => {}
                        Err(error) => self.backend_failure(error, now, delta).await,
                    }
                    return;
                }
            }
        }
    }

    fn resolve_local(&self, kind: CommandKind, delta: &mut PropertyDelta) -> DeviceResult<()> {
        match kind {
            CommandKind::Sync { position } => {
                let Some(mechanical) = delta.position.or(self.snapshot.mechanical_position) else {
                    return Err(DeviceError::InvalidRequest("position not known yet".into()));
                };
                delta.sync_offset = Some(position - mechanical);
                Ok(())
            }
            other => Err(DeviceError::InvalidRequest(format!("{:?} has no local form", other))),
        }
    }

    /// Exactly one receive for the outstanding command, then resolve it if
    /// the reply is complete or its timeout has passed.
    async fn poll_reply(&mut self, now: Instant, delta: &mut PropertyDelta) {
        let kind = self.info.backend;
        let Some(handle) = self.connection.handle() else {
            return;
        };
        match self.adapter.receive(handle).await {
            Ok(Received::Bytes(bytes)) => {
                if let Some(in_flight) = self.queue.in_flight_mut() {
                    in_flight.rx.extend_from_slice(&bytes);
                }
            }
            Ok(Received::WouldBlock) => {}
            Err(error) if classify(kind, error.code) == ErrorClass::Fatal => {
                self.snapshot.comm_errors += 1;
                let message = format!("{} ({})", error.message, classify::code_name(kind, error.code));
                self.invalidate(error.code, message, now).await;
                return;
            }
            Err(error) => {
                debug!("[{}] receive: {}", self.info.id, error);
                if let Some(in_flight) = self.queue.in_flight_mut() {
                    in_flight.surfaced = Some(error);
                }
            }
        }

        let Some(in_flight) = self.queue.in_flight() else {
            return;
        };
        let command_kind = in_flight.command.kind;
        let reply = match &in_flight.command.exchange {
            Exchange::Wire { reply, .. } => *reply,
            _ => ReplyShape::NoReply,
        };
        match assemble(reply, &in_flight.rx) {
            Assembled::Pending => {
                if in_flight.is_expired(now) {
                    let error = match &in_flight.surfaced {
                        // The backend told us why the reply never came.
                        Some(surfaced) => to_device_error(kind, surfaced),
                        None => DeviceError::Timeout(format!(
                            "no reply to {:?} within {:?}",
                            in_flight.command.kind, in_flight.command.timeout
                        )),
                    };
                    self.snapshot.comm_errors += 1;
                    self.resolve(Err(error), now, delta);
                    self.note_timeout(now).await;
                }
            }
            Assembled::Ack(true) => self.resolve(Ok(()), now, delta),
            Assembled::Ack(false) => {
                let error = BackendError::new(classify::ioptron::REJECTED, "command rejected");
                self.resolve(Err(to_device_error(kind, &error)), now, delta);
            }
            Assembled::Frame(layout, frame) => match parse(kind, &Payload::Frame(layout, frame)) {
                Ok(parsed) => {
                    self.last_poll.insert(PollClass::Status, now);
                    delta.merge(parsed);
                    self.resolve(Ok(()), now, delta);
                }
                Err(e) => {
                    self.snapshot.comm_errors += 1;
                    self.resolve(Err(DeviceError::ProtocolViolation(e.to_string())), now, delta);
                    self.fall_back_to_sexagesimal(command_kind);
                }
            },
            Assembled::Garbled(detail) => {
                self.snapshot.comm_errors += 1;
                self.resolve(Err(DeviceError::ProtocolViolation(detail)), now, delta);
                self.fall_back_to_sexagesimal(command_kind);
            }
        }
    }

    /// Coordinates still refresh when the `:GEP#` block keeps garbling.
    fn fall_back_to_sexagesimal(&mut self, garbled: CommandKind) {
        if garbled != CommandKind::PollMountPosition {
            return;
        }
        debug!("[{}] position block unreadable, reading :GR#/:GD#", self.info.id);
        for command in coordinate_fallback(self.settings.command_timeout) {
            self.queue.enqueue(command);
        }
    }

    async fn note_timeout(&mut self, now: Instant) {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        let Some(limit) = self.settings.timeout_escalation else {
            return;
        };
        if self.consecutive_timeouts >= limit {
            let message = format!("{} consecutive timeouts", self.consecutive_timeouts);
            self.invalidate(classify::table(self.info.backend).timeout, message, now)
                .await;
        }
    }

    /// Route a failed backend call by class.
    async fn backend_failure(&mut self, error: BackendError, now: Instant, delta: &PropertyDelta) {
        let kind = self.info.backend;
        self.snapshot.comm_errors += 1;
        match classify(kind, error.code) {
            ErrorClass::Fatal => {
                let message = format!("{} ({})", error.message, classify::code_name(kind, error.code));
                self.invalidate(error.code, message, now).await;
            }
            ErrorClass::Transient => {
                self.resolve(Err(to_device_error(kind, &error)), now, delta);
                if classify::is_timeout(kind, error.code) {
                    self.note_timeout(now).await;
                }
            }
            ErrorClass::Benign => self.resolve(Ok(()), now, delta),
        }
    }

    fn rearm_interval(&self, delta: &PropertyDelta) -> Option<Duration> {
        let moving = delta.moving.unwrap_or(self.snapshot.moving)
            || delta.mount_state.is_some_and(|s| s.is_moving());
        let polling = &self.settings.polling;
        polling.should_poll(moving).then(|| polling.interval(moving))
    }

    fn resolve(&mut self, outcome: DeviceResult<()>, now: Instant, delta: &PropertyDelta) {
        let rearm = self.rearm_interval(delta);
        if outcome.is_ok() {
            self.consecutive_timeouts = 0;
        }
        let failure = outcome.as_ref().err().cloned();
        let Some(command) = self.queue.resolve(outcome, now, rearm) else {
            return;
        };
        if let Some(error) = failure {
            if command.kind == CommandKind::PollTemperature {
                debug!("[{}] temperature poll failed: {}", self.info.id, error);
                return;
            }
            if command.is_periodic() {
                debug!(
                    "[{}] {:?} failed ({} in a row): {}",
                    self.info.id, command.kind, command.retries, error
                );
            } else {
                self.emit(
                    EventCategory::CommandFailed,
                    0,
                    format!("{:?}: {}", command.kind, error),
                );
            }
            self.snapshot.last_error = Some(error);
        }
    }

    fn poll_low_frequency(&mut self, now: Instant) {
        if !self.info.capabilities.has_temperature || !self.queue.is_idle() {
            return;
        }
        let due = self
            .temperature_attempt
            .map_or(true, |at| now.saturating_duration_since(at) >= self.settings.temperature_interval);
        if due
            && self.queue.enqueue(Command::one_shot(
                CommandKind::PollTemperature,
                Exchange::Read(PropertyKey::Temperature),
                self.settings.command_timeout,
            ))
        {
            // A failed read waits out the interval like a successful one.
            self.temperature_attempt = Some(now);
        }
    }

    fn commit(&mut self, delta: PropertyDelta, previous: ConnectionState) {
        let hand_control = self.snapshot_tx.borrow().hand_control;
        self.snapshot
            .apply(delta, unix_ms(), self.settings.temperature_log_len);
        self.snapshot.connection = self.connection.state();
        if self.snapshot.hand_control && !hand_control {
            self.emit(EventCategory::HandControl, 0, "manual control active".to_string());
        }

        let snapshot = &self.snapshot;
        self.snapshot_tx.send_if_modified(|current| {
            if current != snapshot {
                *current = snapshot.clone();
                true
            } else {
                false
            }
        });

        let state = self.connection.state();
        if state != previous {
            info!("[{}] {} -> {}", self.info.id, previous, state);
            self.emitter
                .notify_connection_change(&self.info.id, previous, state);
        }
    }

    fn next_delay(&self, now: Instant) -> Duration {
        if !self.connection.is_open() {
            return self.connection.retry_delay(now).max(MIN_RETRY_DELAY);
        }
        if self.queue.state() == QueueState::Sent {
            return self.settings.reply_poll;
        }
        let mut ceiling = self
            .settings
            .polling
            .interval(self.snapshot.moving)
            .min(IDLE_CEILING);
        if self.info.capabilities.has_temperature {
            let until_temperature = match self.temperature_attempt {
                Some(at) => at
                    .checked_add(self.settings.temperature_interval)
                    .map_or(IDLE_CEILING, |due| due.saturating_duration_since(now)),
                None => Duration::ZERO,
            };
            ceiling = ceiling.min(until_temperature);
        }
        match self.queue.next_due_at(now) {
            Some(at) => at.saturating_duration_since(now).min(ceiling),
            None => ceiling,
        }
    }

    fn emit(&self, category: EventCategory, code: i32, message: String) {
        let event = DeviceEvent::new(self.info.id.clone(), category, code, message);
        self.emitter.notify(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::device::controller::mock::{MockBackend, MockState};
    use crate::device::controller::parser::{encode_mount_position, encode_mount_status};
    use crate::device::controller::policies::NoRetry;
    use crate::device::state::{MountState, PierSide, TrackingRate};
    use crate::device::DeviceId;

    fn setup(
        kind: BackendKind,
        settings: DeviceSettings,
        script: impl FnOnce(&mut MockState),
    ) -> (DeviceEngine, DeviceHandle, Arc<Mutex<MockState>>) {
        let (backend, state) = MockBackend::new(kind);
        script(&mut state.lock().unwrap());
        let adapter = Arc::new(Adapter::new("mock", Box::new(backend), Duration::from_secs(1)));
        let info = DeviceInfo::new(kind.name(), kind, 0);
        let (engine, handle) = DeviceEngine::new(info, settings, adapter);
        (engine, handle, state)
    }

    fn focuser(s: &mut MockState) {
        s.ids = vec![BackendId("eaf-0".into())];
        s.props.insert(PropertyKey::Position, PropertyValue::Int(1000));
        s.props.insert(PropertyKey::MaxPosition, PropertyValue::Int(10_000));
        s.props.insert(
            PropertyKey::Moving,
            PropertyValue::Motion {
                moving: false,
                hand_control: false,
            },
        );
        s.props.insert(PropertyKey::Reverse, PropertyValue::Bool(false));
        s.props.insert(PropertyKey::Backlash, PropertyValue::Int(10));
        s.props.insert(PropertyKey::Temperature, PropertyValue::Float(21.5));
    }

    fn rotator(s: &mut MockState) {
        s.ids = vec![BackendId("caa-0".into())];
        s.props.insert(PropertyKey::Position, PropertyValue::Float(100.0));
        s.props.insert(PropertyKey::Moving, PropertyValue::Bool(false));
        s.props.insert(PropertyKey::Reverse, PropertyValue::Bool(false));
    }

    /// A mount that never answers status queries.
    fn silent_mount(s: &mut MockState) {
        s.ids = vec![BackendId("/dev/ttyUSB0".into())];
    }

    fn mount(s: &mut MockState) {
        silent_mount(s);
        let gep = encode_mount_position(5.5, 20.0, PierSide::West);
        let (head, tail) = gep.split_at(8);
        s.replies.insert(
            b":GEP#".to_vec(),
            vec![head.as_bytes().to_vec(), tail.as_bytes().to_vec()],
        );
        s.replies.insert(
            b":GLS#".to_vec(),
            vec![encode_mount_status(19.9, 50.1, MountState::Tracking, 0).into_bytes()],
        );
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(EventCategory, i32)>>,
        changes: Mutex<Vec<(ConnectionState, ConnectionState)>>,
    }

    impl DeviceListener for Recorder {
        fn notify(&self, event: &DeviceEvent) {
            self.events.lock().unwrap().push((event.category, event.code));
        }

        fn on_connection_change(&self, _device: &DeviceId, old: ConnectionState, new: ConnectionState) {
            self.changes.lock().unwrap().push((old, new));
        }
    }

    #[tokio::test]
    async fn test_open_hydrates_and_ensure_open_is_idempotent() {
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;

        let snap = handle.snapshot();
        assert_eq!(snap.connection, ConnectionState::Open);
        assert_eq!(snap.position, Some(1000.0));
        assert_eq!(snap.target_position, Some(1000.0));
        assert_eq!(snap.min_position, Some(0.0));
        assert_eq!(snap.max_position, Some(10_000.0));
        assert_eq!(snap.backlash, Some(10));
        assert_eq!(snap.temperature_c, Some(21.5));
        assert_eq!(snap.temperature_log.len(), 1);

        let calls = engine.adapter.call_count();
        assert!(engine.ensure_open(Instant::now()).await);
        assert!(engine.ensure_open(Instant::now()).await);
        assert_eq!(engine.adapter.call_count(), calls);

        let s = state.lock().unwrap();
        assert_eq!((s.enumerate_calls, s.open_calls), (1, 1));
    }

    #[tokio::test]
    async fn test_in_tolerance_move_never_reaches_the_wire() {
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;

        let mut ticket = handle.request_move(1000.05).unwrap();
        engine.tick().await;
        assert_eq!(ticket.try_result(), Some(Ok(())));
        assert!(state.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_move_writes_target_then_polls_back() {
        tokio::time::pause();
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;

        let mut ticket = handle.request_move(2500.0).unwrap();
        engine.tick().await;
        assert_eq!(ticket.try_result(), Some(Ok(())));
        assert_eq!(
            state.lock().unwrap().writes,
            vec![(PropertyKey::Target, PropertyValue::Int(2500))]
        );
        let snap = handle.snapshot();
        assert!(snap.moving);
        assert_eq!(snap.target_position, Some(2500.0));

        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..3 {
            engine.tick().await;
        }
        let snap = handle.snapshot();
        assert!(!snap.moving);
        assert_eq!(snap.position, Some(2500.0));
        assert_eq!(snap.target_position, Some(2500.0));
    }

    #[tokio::test]
    async fn test_invalid_request_is_refused_before_queueing() {
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;

        assert!(matches!(
            handle.request_move(20_000.0),
            Err(DeviceError::InvalidRequest(_))
        ));
        assert!(matches!(
            handle.request(DeviceCommand::Park),
            Err(DeviceError::NotSupported(_))
        ));
        engine.tick().await;
        assert!(state.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_code_closes_without_touching_snapshot() {
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;

        state.lock().unwrap().failures.push_back(4);
        let ticket = handle.request_move(3000.0).unwrap();
        engine.tick().await;

        assert_eq!(engine.connection_state(), ConnectionState::Closed);
        assert!(matches!(ticket.wait().await, Err(DeviceError::ConnectionLost(_))));
        let snap = handle.snapshot();
        assert_eq!(snap.connection, ConnectionState::Closed);
        assert_eq!(snap.position, Some(1000.0));
        assert_eq!(state.lock().unwrap().close_calls, 1);
    }

    #[tokio::test]
    async fn test_transient_code_keeps_connection() {
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;

        state.lock().unwrap().failures.push_back(5);
        let ticket = handle.request_move(3000.0).unwrap();
        engine.tick().await;

        assert_eq!(engine.connection_state(), ConnectionState::Open);
        assert!(matches!(ticket.wait().await, Err(DeviceError::HardwareBusy(_))));
        assert_eq!(handle.snapshot().comm_errors, 1);
    }

    #[tokio::test]
    async fn test_busy_then_timeout_dispatches_next_on_following_tick() {
        tokio::time::pause();
        let (mut engine, handle, state) = setup(BackendKind::IOptron, DeviceSettings::default(), silent_mount);
        engine.tick().await;
        assert_eq!(engine.queue().state(), QueueState::Sent);

        state
            .lock()
            .unwrap()
            .failures
            .push_back(classify::ioptron::REJECTED);
        let mut ticket = handle.request(DeviceCommand::Park).unwrap();
        engine.tick().await;
        assert_eq!(engine.queue().state(), QueueState::Sent);

        tokio::time::advance(Duration::from_secs(2)).await;
        engine.tick().await;
        assert_eq!(engine.queue().state(), QueueState::Idle);
        assert_eq!(engine.connection_state(), ConnectionState::Open);
        assert!(matches!(
            handle.snapshot().last_error,
            Some(DeviceError::HardwareBusy(_))
        ));
        assert_eq!(state.lock().unwrap().sent_text(), vec![":GEP#"]);

        engine.tick().await;
        assert_eq!(state.lock().unwrap().sent_text(), vec![":GEP#", ":MP1#"]);
        engine.tick().await;
        assert_eq!(ticket.try_result(), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_removal_reenumerates_and_rehydrates() {
        tokio::time::pause();
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;

        {
            let mut s = state.lock().unwrap();
            s.ids.clear();
            s.failures.push_back(4);
        }
        engine.tick().await;
        assert_eq!(engine.connection_state(), ConnectionState::Closed);

        engine.tick().await;
        assert_eq!(engine.connection_state(), ConnectionState::Closed);
        assert_eq!(engine.connection().failures(), 1);

        {
            let mut s = state.lock().unwrap();
            s.ids = vec![BackendId("eaf-7".into())];
            s.props.insert(PropertyKey::Position, PropertyValue::Int(4242));
        }
        engine.tick().await;
        assert_eq!(state.lock().unwrap().enumerate_calls, 2);

        tokio::time::advance(Duration::from_millis(250)).await;
        engine.tick().await;
        assert_eq!(engine.connection_state(), ConnectionState::Open);
        assert_eq!(
            engine.connection().backend_id(),
            Some(&BackendId("eaf-7".into()))
        );
        let snap = handle.snapshot();
        assert_eq!(snap.position, Some(4242.0));
        assert_eq!(snap.comm_errors, 0);
        assert_eq!(state.lock().unwrap().enumerate_calls, 3);
    }

    #[tokio::test]
    async fn test_timeout_escalation_closes_after_limit() {
        tokio::time::pause();
        let settings = DeviceSettings {
            timeout_escalation: Some(2),
            ..DeviceSettings::default()
        };
        let (mut engine, _handle, _state) = setup(BackendKind::IOptron, settings, silent_mount);
        engine.tick().await;

        tokio::time::advance(Duration::from_secs(2)).await;
        engine.tick().await;
        assert_eq!(engine.connection_state(), ConnectionState::Open);

        engine.tick().await;
        assert_eq!(engine.queue().state(), QueueState::Sent);
        tokio::time::advance(Duration::from_secs(2)).await;
        engine.tick().await;
        assert_eq!(engine.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_timeouts_alone_never_close() {
        tokio::time::pause();
        let (mut engine, _handle, _state) = setup(BackendKind::IOptron, DeviceSettings::default(), silent_mount);
        for _ in 0..6 {
            engine.tick().await;
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(engine.connection_state(), ConnectionState::Open);
        assert!(engine.snapshot().comm_errors >= 2);
    }

    #[tokio::test]
    async fn test_sync_offsets_rotator_position() {
        tokio::time::pause();
        let (mut engine, handle, state) = setup(BackendKind::ZwoCaa, DeviceSettings::default(), rotator);
        engine.tick().await;
        assert_eq!(handle.snapshot().max_position, Some(360.0));

        let mut ticket = handle.request(DeviceCommand::Sync { position: 90.0 }).unwrap();
        engine.tick().await;
        assert_eq!(ticket.try_result(), Some(Ok(())));
        let snap = handle.snapshot();
        assert_eq!(snap.position, Some(90.0));
        assert_eq!(snap.mechanical_position, Some(100.0));

        let mut ticket = handle.request_move(45.0).unwrap();
        engine.tick().await;
        assert_eq!(ticket.try_result(), Some(Ok(())));
        assert_eq!(
            state.lock().unwrap().writes,
            vec![(PropertyKey::Target, PropertyValue::Float(55.0))]
        );
    }

    #[tokio::test]
    async fn test_temperature_polled_when_idle() {
        tokio::time::pause();
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;
        state
            .lock()
            .unwrap()
            .props
            .insert(PropertyKey::Temperature, PropertyValue::Float(19.0));

        tokio::time::advance(Duration::from_secs(15)).await;
        for _ in 0..4 {
            engine.tick().await;
        }
        let snap = handle.snapshot();
        assert_eq!(snap.temperature_c, Some(19.0));
        assert_eq!(snap.temperature_log.len(), 2);
    }

    #[tokio::test]
    async fn test_events_on_open_hand_control_and_loss() {
        let (mut engine, _handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), |s| {
            focuser(s);
            s.props.insert(
                PropertyKey::Moving,
                PropertyValue::Motion {
                    moving: false,
                    hand_control: true,
                },
            );
        });
        let recorder = Arc::new(Recorder::default());
        engine.register_listener(recorder.clone());

        engine.tick().await;
        state.lock().unwrap().failures.push_back(9);
        engine.tick().await;

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                (EventCategory::ConnectionOpened, 0),
                (EventCategory::HandControl, 0),
                (EventCategory::ConnectionLost, 9),
            ]
        );
        assert_eq!(
            *recorder.changes.lock().unwrap(),
            vec![
                (ConnectionState::Closed, ConnectionState::Open),
                (ConnectionState::Open, ConnectionState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_single_in_flight_under_concurrent_requests() {
        let (mut engine, handle, state) = setup(BackendKind::IOptron, DeviceSettings::default(), mount);
        engine.tick().await;

        let submitter = tokio::spawn(async move {
            let mut tickets = Vec::new();
            for i in 0..24 {
                match handle.request(DeviceCommand::SetTracking { enabled: i % 2 == 0 }) {
                    Ok(ticket) => tickets.push(ticket),
                    Err(e) => assert!(matches!(e, DeviceError::HardwareBusy(_))),
                }
                tokio::task::yield_now().await;
            }
            tickets
        });
        for _ in 0..100 {
            engine.tick().await;
            tokio::task::yield_now().await;
        }
        let tickets = submitter.await.unwrap();
        for _ in 0..100 {
            engine.tick().await;
        }

        for mut ticket in tickets {
            assert!(matches!(
                ticket.try_result(),
                Some(Ok(())) | Some(Err(DeviceError::HardwareBusy(_)))
            ));
        }
        assert_eq!(state.lock().unwrap().overlapping_sends, 0);

        let snap = engine.snapshot();
        assert_eq!(snap.mount.pier_side, Some(PierSide::West));
        assert_eq!(snap.mount.state, Some(MountState::Tracking));
        assert!((snap.mount.ra_hours.unwrap() - 5.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_closes() {
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), focuser);
        engine.tick().await;
        let ticket = handle.request_move(4000.0).unwrap();

        engine.shutdown().await;
        assert!(matches!(ticket.wait().await, Err(DeviceError::ConnectionLost(_))));
        assert_eq!(state.lock().unwrap().close_calls, 1);
        assert_eq!(handle.snapshot().connection, ConnectionState::Closed);
        assert!(handle.request_move(100.0).is_err());
    }

    #[tokio::test]
    async fn test_unreadable_temperature_does_not_starve_status_polls() {
        tokio::time::pause();
        let (mut engine, _handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), |s| {
            focuser(s);
            s.props.remove(&PropertyKey::Temperature);
        });

        let start = Instant::now();
        for _ in 0..200 {
            let delay = engine.tick().await;
            tokio::time::advance(delay).await;
        }
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(30), "{:?}", elapsed);

        let s = state.lock().unwrap();
        let count = |key: PropertyKey| s.reads.iter().filter(|k| **k == key).count() as u64;
        assert!(
            count(PropertyKey::Temperature) <= elapsed.as_secs() / 15 + 2,
            "{} temperature reads in {:?}",
            count(PropertyKey::Temperature),
            elapsed
        );
        assert!(count(PropertyKey::Position) >= 20);
        assert_eq!(engine.connection_state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_failed_temperature_poll_is_only_logged() {
        tokio::time::pause();
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, DeviceSettings::default(), |s| {
            focuser(s);
            s.props.remove(&PropertyKey::Temperature);
        });
        let recorder = Arc::new(Recorder::default());
        engine.register_listener(recorder.clone());

        for _ in 0..4 {
            engine.tick().await;
        }
        tokio::time::advance(Duration::from_secs(15)).await;
        for _ in 0..4 {
            engine.tick().await;
        }

        let reads = state.lock().unwrap().reads.clone();
        assert!(reads.iter().filter(|k| **k == PropertyKey::Temperature).count() >= 3);
        assert!(handle.snapshot().last_error.is_none());
        assert!(!recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|(category, _)| *category == EventCategory::CommandFailed));
    }

    #[tokio::test]
    async fn test_general_errors_do_not_escalate_but_call_timeouts_do() {
        tokio::time::pause();
        let settings = DeviceSettings {
            timeout_escalation: Some(2),
            ..DeviceSettings::default()
        };
        let (mut engine, handle, state) = setup(BackendKind::ZwoEaf, settings, focuser);
        engine.tick().await;

        for target in [3000.0, 4000.0, 5000.0] {
            state.lock().unwrap().failures.push_back(7);
            let ticket = handle.request_move(target).unwrap();
            engine.tick().await;
            assert!(matches!(ticket.wait().await, Err(DeviceError::HardwareBusy(_))));
        }
        assert_eq!(engine.connection_state(), ConnectionState::Open);

        for target in [3000.0, 4000.0] {
            state.lock().unwrap().failures.push_back(classify::CALL_TIMEOUT);
            let ticket = handle.request_move(target).unwrap();
            engine.tick().await;
            assert!(ticket.wait().await.is_err());
        }
        assert_eq!(engine.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_fatal_code_while_hydrating_closes_instead_of_degrading() {
        tokio::time::pause();
        let settings = DeviceSettings {
            reopen: Arc::new(NoRetry),
            ..DeviceSettings::default()
        };
        let (mut engine, _handle, state) = setup(BackendKind::ZwoEaf, settings, |s| {
            focuser(s);
            s.failures.push_back(4);
        });
        let recorder = Arc::new(Recorder::default());
        engine.register_listener(recorder.clone());
        engine.tick().await;

        assert_eq!(engine.connection_state(), ConnectionState::Closed);
        assert_eq!(engine.connection().failures(), 1);
        assert!(!engine.connection().attempt_due(Instant::now()));
        assert_eq!(state.lock().unwrap().close_calls, 1);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![(EventCategory::OpenFailed, 4)]
        );
    }

    #[tokio::test]
    async fn test_garbled_position_block_falls_back_to_sexagesimal() {
        let (mut engine, handle, state) = setup(BackendKind::IOptron, DeviceSettings::default(), |s| {
            mount(s);
            s.replies.insert(b":GEP#".to_vec(), vec![b"garbage#".to_vec()]);
            s.replies.insert(b":GR#".to_vec(), vec![b"05:30:00#".to_vec()]);
            s.replies.insert(b":GD#".to_vec(), vec![b"+20*15:00#".to_vec()]);
        });
        for _ in 0..12 {
            engine.tick().await;
        }

        let sent = state.lock().unwrap().sent_text();
        assert!(sent.contains(&":GR#".to_string()), "{:?}", sent);
        assert!(sent.contains(&":GD#".to_string()), "{:?}", sent);
        let snap = handle.snapshot();
        assert!((snap.mount.ra_hours.unwrap() - 5.5).abs() < 1e-9);
        assert!((snap.mount.dec_deg.unwrap() - 20.25).abs() < 1e-9);
        assert_eq!(snap.mount.state, Some(MountState::Tracking));
        assert!(snap.comm_errors >= 1);
    }

    #[tokio::test]
    async fn test_mount_sync_and_tracking_rate_reach_the_wire() {
        let (mut engine, handle, state) = setup(BackendKind::IOptron, DeviceSettings::default(), mount);
        engine.tick().await;

        let mut sync = handle
            .request(DeviceCommand::SyncTo {
                ra_hours: 6.0,
                dec_deg: -12.5,
            })
            .unwrap();
        let mut rate = handle
            .request(DeviceCommand::SetTrackingRate {
                rate: TrackingRate::Lunar,
            })
            .unwrap();
        for _ in 0..20 {
            engine.tick().await;
        }

        assert_eq!(sync.try_result(), Some(Ok(())));
        assert_eq!(rate.try_result(), Some(Ok(())));
        let sent = state.lock().unwrap().sent_text();
        let at = sent.iter().position(|p| p == ":SRA032400000#").unwrap();
        assert_eq!(sent[at + 1..at + 3], [":Sd-04500000#", ":CM#"]);
        assert!(sent.contains(&":RT1#".to_string()));
    }
}
