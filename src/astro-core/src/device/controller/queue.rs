// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Command queue and reply correlation.
//!
//! The wire protocols behind these devices are half-duplex, so the queue
//! keeps at most one command in flight. Per device it moves
//! `Idle -> Sent -> Idle`; while `Sent` nothing else is dispatched.
//! Priority one-shots (halt) go first, then one-shots in FIFO order, then
//! periodic commands whose re-arm time has passed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::backend::BackendError;
use crate::device::command::{Command, RequestId};
use crate::device::response::{DeviceError, DeviceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Sent,
}

/// The command currently awaiting resolution.
#[derive(Debug)]
pub struct InFlight {
    pub command: Command,
    pub sent_at: Instant,
    /// Reply bytes accumulated so far.
    pub rx: Vec<u8>,
    /// Last non-fatal backend code surfaced while waiting for the reply.
    pub surfaced: Option<BackendError>,
    slot: Option<usize>,
}

impl InFlight {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) >= self.command.timeout
    }
}

#[derive(Debug)]
struct PeriodicSlot {
    command: Command,
    /// `None` while in flight or disarmed.
    due: Option<Instant>,
}

#[derive(Debug)]
struct Waiter {
    remaining: usize,
    respond_to: oneshot::Sender<DeviceResult<()>>,
}

#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    priority: VecDeque<Command>,
    pending: VecDeque<Command>,
    periodic: Vec<PeriodicSlot>,
    in_flight: Option<InFlight>,
    waiters: HashMap<RequestId, Waiter>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            priority: VecDeque::new(),
            pending: VecDeque::new(),
            periodic: Vec::new(),
            in_flight: None,
            waiters: HashMap::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        if self.in_flight.is_some() {
            QueueState::Sent
        } else {
            QueueState::Idle
        }
    }

    /// Number of queued one-shot commands, excluding the one in flight.
    pub fn queued(&self) -> usize {
        self.priority.len() + self.pending.len()
    }

    /// Nothing in flight and no one-shot waiting.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queued() == 0
    }

    /// Queue a command. Periodic commands get a slot, disarmed until
    /// `arm_periodic`; one-shots are refused when the queue is full.
    pub fn enqueue(&mut self, command: Command) -> bool {
        if command.is_periodic() {
            self.periodic.push(PeriodicSlot { command, due: None });
            return true;
        }
        if self.queued() >= self.capacity {
            return false;
        }
        self.push_one_shot(command);
        true
    }

    /// Queue all commands expanded from one request, or none of them.
    /// The responder fires once: after the last command succeeds, or on
    /// the first failure.
    pub fn enqueue_request(
        &mut self,
        commands: Vec<Command>,
        respond_to: oneshot::Sender<DeviceResult<()>>,
    ) -> bool {
        if commands.is_empty() {
            let _ = respond_to.send(Ok(()));
            return true;
        }
        if self.queued() + commands.len() > self.capacity {
            let _ = respond_to.send(Err(DeviceError::HardwareBusy(
                "command queue full".into(),
            )));
            return false;
        }
        let id = RequestId::new();
        self.waiters.insert(
            id,
            Waiter {
                remaining: commands.len(),
                respond_to,
            },
        );
        for mut command in commands {
            command.request = Some(id);
            self.push_one_shot(command);
        }
        true
    }

    fn push_one_shot(&mut self, command: Command) {
        if command.priority {
            self.priority.push_back(command);
        } else {
            self.pending.push_back(command);
        }
    }

    /// Make every periodic slot due at `now`.
    pub fn arm_periodic(&mut self, now: Instant) {
        let in_flight_slot = self.in_flight.as_ref().and_then(|f| f.slot);
        for (i, slot) in self.periodic.iter_mut().enumerate() {
            if Some(i) != in_flight_slot {
                slot.due = Some(now);
            }
        }
    }

    pub fn periodic_len(&self) -> usize {
        self.periodic.len()
    }

    /// Pop the next due command and mark it sent. Returns `None` while a
    /// command is already in flight.
    pub fn start_next(&mut self, now: Instant) -> Option<&mut InFlight> {
        if self.in_flight.is_some() {
            return None;
        }
        let (command, slot) = if let Some(command) = self.priority.pop_front() {
            (command, None)
        } else if let Some(command) = self.pending.pop_front() {
            (command, None)
        } else {
            let index = self
                .periodic
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.due.filter(|due| *due <= now).map(|due| (i, due)))
                .min_by_key(|(_, due)| *due)
                .map(|(i, _)| i)?;
            let slot = &mut self.periodic[index];
            slot.due = None;
            (slot.command.clone(), Some(index))
        };
        self.in_flight = Some(InFlight {
            command,
            sent_at: now,
            rx: Vec::new(),
            surfaced: None,
            slot,
        });
        self.in_flight.as_mut()
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn in_flight_mut(&mut self) -> Option<&mut InFlight> {
        self.in_flight.as_mut()
    }

    /// Resolve the in-flight command exactly once and return to `Idle`.
    /// A periodic command is re-armed `rearm` from now; `None` leaves it
    /// disarmed.
    pub fn resolve(
        &mut self,
        outcome: DeviceResult<()>,
        now: Instant,
        rearm: Option<Duration>,
    ) -> Option<Command> {
        let mut in_flight = self.in_flight.take()?;
        if let Some(slot) = in_flight.slot.and_then(|i| self.periodic.get_mut(i)) {
            slot.command.retries = if outcome.is_ok() {
                0
            } else {
                slot.command.retries.saturating_add(1)
            };
            in_flight.command.retries = slot.command.retries;
            slot.due = rearm.and_then(|interval| now.checked_add(interval));
        }
        if let Some(id) = in_flight.command.request {
            self.settle(id, outcome);
        }
        Some(in_flight.command)
    }

    fn settle(&mut self, id: RequestId, outcome: DeviceResult<()>) {
        match outcome {
            Ok(()) => {
                let done = match self.waiters.get_mut(&id) {
                    Some(waiter) => {
                        waiter.remaining = waiter.remaining.saturating_sub(1);
                        waiter.remaining == 0
                    }
                    None => false,
                };
                if done {
                    if let Some(waiter) = self.waiters.remove(&id) {
                        let _ = waiter.respond_to.send(Ok(()));
                    }
                }
            }
            Err(err) => {
                // Remaining steps of a failed request never reach the wire.
                self.priority.retain(|c| c.request != Some(id));
                self.pending.retain(|c| c.request != Some(id));
                if let Some(waiter) = self.waiters.remove(&id) {
                    let _ = waiter.respond_to.send(Err(err));
                }
            }
        }
    }

    /// Fail the in-flight command, if any, leaving queued commands alone.
    pub fn clear_in_flight(&mut self, err: DeviceError, now: Instant) -> Option<Command> {
        self.resolve(Err(err), now, None)
    }

    /// Fail everything outstanding. Periodic slots stay registered but
    /// disarmed until the next `arm_periodic`.
    pub fn fail_all(&mut self, err: DeviceError) -> usize {
        let mut failed = 0;
        if let Some(in_flight) = self.in_flight.take() {
            failed += 1;
            if let Some(id) = in_flight.command.request {
                self.settle(id, Err(err.clone()));
            }
        }
        failed += self.queued();
        self.priority.clear();
        self.pending.clear();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.respond_to.send(Err(err.clone()));
        }
        for slot in &mut self.periodic {
            slot.due = None;
        }
        failed
    }

    /// When the next command becomes dispatchable, if any.
    pub fn next_due_at(&self, now: Instant) -> Option<Instant> {
        if self.in_flight.is_some() {
            return None;
        }
        if self.queued() > 0 {
            return Some(now);
        }
        self.periodic.iter().filter_map(|slot| slot.due).min()
    }
}
