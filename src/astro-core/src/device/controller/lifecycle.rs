// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Connection state machine and reopen bookkeeping.
//!
//! The machine only knows states and events. `ConnectionManager` adds the
//! open handle, the resolved backend id and the reopen schedule. The I/O
//! for opening lives in the engine because it also hydrates the snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::{BackendError, BackendId, BackendKind, Handle};
use crate::device::state::ConnectionState;

use super::classify;
use super::policies::{OpenStreak, ReopenPolicy};

/// Events that can trigger connection state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    OpenStarted,
    Opened,
    /// `exhausted` once the reopen policy reports the device degraded.
    OpenFailed { exhausted: bool },
    /// Fatal backend code observed.
    Invalidated,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    transition_count: u64,
    last_transition: Option<Instant>,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Closed,
            transition_count: 0,
            last_transition: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Process an event. Returns true if a transition occurred.
    pub fn process_event(&mut self, event: ConnectionEvent) -> bool {
        match self.next_state(event) {
            Some(state) => {
                self.state = state;
                self.transition_count += 1;
                self.last_transition = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    fn next_state(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self.state, event) {
            (Closed | Degraded, ConnectionEvent::OpenStarted) => Some(Opening),
            (Opening, ConnectionEvent::Opened) => Some(Open),
            (Opening, ConnectionEvent::OpenFailed { exhausted: true }) => Some(Degraded),
            (Opening, ConnectionEvent::OpenFailed { exhausted: false }) => Some(Closed),
            (Closed, ConnectionEvent::Invalidated) => None,
            (_, ConnectionEvent::Invalidated) => Some(Closed),
            _ => None,
        }
    }
}

/// One open or reopen cycle. Drives backoff and logging only.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub backend_id: Option<BackendId>,
    /// Backend result code, 0 on success.
    pub code: i32,
    pub at: Instant,
}

#[derive(Debug)]
pub struct ConnectionManager {
    kind: BackendKind,
    machine: ConnectionMachine,
    policy: Arc<dyn ReopenPolicy>,
    backend_id: Option<BackendId>,
    handle: Option<Handle>,
    streak: OpenStreak,
    next_attempt_at: Option<Instant>,
    last_attempt: Option<ConnectionAttempt>,
}

impl ConnectionManager {
    pub fn new(kind: BackendKind, policy: Arc<dyn ReopenPolicy>) -> Self {
        Self {
            kind,
            machine: ConnectionMachine::new(),
            policy,
            backend_id: None,
            handle: None,
            streak: OpenStreak::default(),
            next_attempt_at: None,
            last_attempt: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    pub fn backend_id(&self) -> Option<&BackendId> {
        self.backend_id.as_ref()
    }

    /// Consecutive failed open attempts.
    pub fn failures(&self) -> u32 {
        self.streak.failures
    }

    pub fn streak(&self) -> OpenStreak {
        self.streak
    }

    pub fn last_attempt(&self) -> Option<&ConnectionAttempt> {
        self.last_attempt.as_ref()
    }

    pub fn machine(&self) -> &ConnectionMachine {
        &self.machine
    }

    /// A reopen may be tried at `now`.
    pub fn attempt_due(&self, now: Instant) -> bool {
        !self.is_open() && self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub fn begin_attempt(&mut self) -> bool {
        self.machine.process_event(ConnectionEvent::OpenStarted)
    }

    pub fn opened(&mut self, id: BackendId, handle: Handle, now: Instant) {
        self.last_attempt = Some(ConnectionAttempt {
            backend_id: Some(id.clone()),
            code: 0,
            at: now,
        });
        self.backend_id = Some(id);
        self.handle = Some(handle);
        self.streak = OpenStreak::default();
        self.next_attempt_at = None;
        self.machine.process_event(ConnectionEvent::Opened);
    }

    /// An open attempt failed. The reopen policy picks the wait and whether
    /// the device is now reported `Degraded`.
    pub fn failed(&mut self, id: Option<BackendId>, err: &BackendError, now: Instant) {
        let exhausted = self.record_failure(id, err, now);
        self.machine
            .process_event(ConnectionEvent::OpenFailed { exhausted });
    }

    /// The device opened, then returned a fatal code before it was usable.
    /// Reopen waits as after a failed open, but the state is `Closed`
    /// whatever the streak.
    pub fn lost_while_opening(&mut self, id: Option<BackendId>, err: &BackendError, now: Instant) {
        self.record_failure(id, err, now);
        self.machine.process_event(ConnectionEvent::Invalidated);
    }

    fn record_failure(&mut self, id: Option<BackendId>, err: &BackendError, now: Instant) -> bool {
        let rejected_id = err.code == classify::table(self.kind).invalid_id;
        self.streak.record(rejected_id);
        self.last_attempt = Some(ConnectionAttempt {
            backend_id: id,
            code: err.code,
            at: now,
        });
        self.handle = None;
        self.next_attempt_at = now.checked_add(self.policy.backoff(&self.streak));
        self.policy.exhausted(&self.streak)
    }

    /// Drop the connection after a fatal code. The handle is returned so
    /// the caller can close it; the next attempt is due immediately.
    pub fn invalidate(&mut self, now: Instant) -> Option<Handle> {
        self.machine.process_event(ConnectionEvent::Invalidated);
        self.streak = OpenStreak::default();
        self.next_attempt_at = Some(now);
        self.handle.take()
    }

    /// Time until the next reopen attempt.
    pub fn retry_delay(&self, now: Instant) -> Duration {
        self.next_attempt_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}
