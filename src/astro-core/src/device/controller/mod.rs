// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Device controller components.
//!
//! This module contains the per-device engine: error classification,
//! response parsing, the single-in-flight command queue, the connection
//! lifecycle, and the tick that orchestrates them.

pub mod classify;
pub mod engine;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod parser;
pub mod policies;
pub mod queue;

#[cfg(test)]
pub(crate) mod mock;

pub use classify::{classify, is_timeout, CodeEntry, CodeTable, ErrorClass, CALL_TIMEOUT};
pub use engine::DeviceEngine;
pub use events::{
    BroadcastListener, DeviceEvent, DeviceEventEmitter, DeviceListener, EventCategory, ListenerId,
    TracingListener,
};
pub use handlers::{commands_for, periodic_commands, validate, CommandContext, ValidationResult};
pub use lifecycle::{ConnectionAttempt, ConnectionEvent, ConnectionManager, ConnectionMachine};
pub use parser::{parse, ParseError, Payload};
pub use policies::{
    AdaptivePolling, ExponentialBackoff, FixedDelay, FixedPolling, NoPolling, NoRetry, OpenStreak,
    PollingPolicy, ReopenPolicy,
};
pub use queue::{CommandQueue, InFlight, QueueState};
