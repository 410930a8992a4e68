// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Reopen and polling policies.
//!
//! A reopen policy looks at the streak of failed opens for one device and
//! picks the wait before the next open, and the point at which the device
//! is reported `Degraded`. Degraded devices are still reopened; only the
//! reported state changes.

use std::fmt::Debug;
use std::time::Duration;

/// Failed opens since the device was last open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenStreak {
    pub failures: u32,
    /// Trailing failures where the backend refused an id it had just
    /// enumerated, usually because another process holds the device.
    pub rejected_ids: u32,
}

impl OpenStreak {
    /// Record one more failed open.
    pub fn record(&mut self, rejected_id: bool) {
        self.failures = self.failures.saturating_add(1);
        self.rejected_ids = if rejected_id {
            self.rejected_ids.saturating_add(1)
        } else {
            0
        };
    }
}

/// How a closed device is reopened.
pub trait ReopenPolicy: Debug + Send + Sync {
    /// Wait before the next open. `streak.failures` is at least 1.
    fn backoff(&self, streak: &OpenStreak) -> Duration;

    /// Whether the streak is long enough to report the device `Degraded`.
    fn exhausted(&self, streak: &OpenStreak) -> bool;
}

/// Refused ids in a row that report the device `Degraded` early.
const REJECTED_ID_LIMIT: u32 = 2;

/// Wait between opens once a policy without retries has given up.
const DEGRADED_REOPEN: Duration = Duration::from_secs(30);

/// Doubling wait between opens, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_failures: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_failures: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_failures,
            base_delay,
            max_delay,
        }
    }

    /// Defaults for a hot-pluggable USB device: five opens inside ~4s.
    pub fn default_reopen() -> Self {
        Self {
            max_failures: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::default_reopen()
    }
}

impl ReopenPolicy for ExponentialBackoff {
    fn backoff(&self, streak: &OpenStreak) -> Duration {
        let exponent = streak.failures.saturating_sub(1);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    fn exhausted(&self, streak: &OpenStreak) -> bool {
        streak.failures >= self.max_failures || streak.rejected_ids >= REJECTED_ID_LIMIT
    }
}

/// Same wait after every failed open.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    max_failures: u32,
    delay: Duration,
}

impl FixedDelay {
    pub fn new(max_failures: u32, delay: Duration) -> Self {
        Self {
            max_failures,
            delay,
        }
    }
}

impl ReopenPolicy for FixedDelay {
    fn backoff(&self, _streak: &OpenStreak) -> Duration {
        self.delay
    }

    fn exhausted(&self, streak: &OpenStreak) -> bool {
        streak.failures >= self.max_failures || streak.rejected_ids >= REJECTED_ID_LIMIT
    }
}

/// The first failed open reports `Degraded`; later opens are slow.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl ReopenPolicy for NoRetry {
    fn backoff(&self, _streak: &OpenStreak) -> Duration {
        DEGRADED_REOPEN
    }

    fn exhausted(&self, _streak: &OpenStreak) -> bool {
        true
    }
}

/// How often periodic status commands are rearmed.
pub trait PollingPolicy: Debug + Send + Sync {
    /// Interval between status cycles; `active` while the device moves.
    fn interval(&self, active: bool) -> Duration;

    fn should_poll(&self, active: bool) -> bool;
}

/// Faster status cycles while the device moves, so position and the
/// moving flag follow the motion.
#[derive(Debug, Clone)]
pub struct AdaptivePolling {
    idle_interval: Duration,
    active_interval: Duration,
}

impl AdaptivePolling {
    pub fn new(idle_interval: Duration, active_interval: Duration) -> Self {
        Self {
            idle_interval,
            active_interval,
        }
    }

    /// One status cycle per second while idle.
    pub fn default_device() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            active_interval: Duration::from_millis(250),
        }
    }
}

impl Default for AdaptivePolling {
    fn default() -> Self {
        Self::default_device()
    }
}

impl PollingPolicy for AdaptivePolling {
    fn interval(&self, active: bool) -> Duration {
        if active {
            self.active_interval
        } else {
            self.idle_interval
        }
    }

    fn should_poll(&self, _active: bool) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct FixedPolling {
    interval: Duration,
}

impl FixedPolling {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl PollingPolicy for FixedPolling {
    fn interval(&self, _active: bool) -> Duration {
        self.interval
    }

    fn should_poll(&self, _active: bool) -> bool {
        true
    }
}

/// Periodic status commands never rearm; only requests reach the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPolling;

impl PollingPolicy for NoPolling {
    fn interval(&self, _active: bool) -> Duration {
        Duration::MAX
    }

    fn should_poll(&self, _active: bool) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streak(failures: u32, rejected_ids: u32) -> OpenStreak {
        OpenStreak {
            failures,
            rejected_ids,
        }
    }

    #[test]
    fn test_backoff_doubles_per_failed_open() {
        let policy = ExponentialBackoff::new(5, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.backoff(&streak(1, 0)), Duration::from_millis(100));
        assert_eq!(policy.backoff(&streak(2, 0)), Duration::from_millis(200));
        assert_eq!(policy.backoff(&streak(4, 0)), Duration::from_millis(800));
        assert_eq!(policy.backoff(&streak(5, 0)), Duration::from_secs(1));
        assert_eq!(policy.backoff(&streak(40, 0)), Duration::from_secs(1));
    }

    #[test]
    fn test_degraded_after_budget_or_refused_ids() {
        let policy = ExponentialBackoff::new(3, Duration::from_millis(100), Duration::from_secs(1));

        assert!(!policy.exhausted(&streak(2, 0)));
        assert!(policy.exhausted(&streak(3, 0)));
        assert!(!policy.exhausted(&streak(1, 1)));
        assert!(policy.exhausted(&streak(2, 2)));
        assert!(FixedDelay::new(10, Duration::from_secs(1)).exhausted(&streak(2, 2)));
    }

    #[test]
    fn test_streak_resets_refused_ids_on_other_failures() {
        let mut s = OpenStreak::default();
        s.record(true);
        s.record(false);
        s.record(true);
        assert_eq!(s, streak(3, 1));
        s.record(true);
        assert_eq!(s.rejected_ids, 2);
    }

    #[test]
    fn test_fixed_delay_and_no_retry() {
        let policy = FixedDelay::new(3, Duration::from_millis(500));
        assert_eq!(policy.backoff(&streak(1, 0)), Duration::from_millis(500));
        assert_eq!(policy.backoff(&streak(6, 0)), Duration::from_millis(500));
        assert!(!policy.exhausted(&streak(2, 0)));

        assert!(NoRetry.exhausted(&streak(1, 0)));
        assert_eq!(NoRetry.backoff(&streak(1, 0)), DEGRADED_REOPEN);
    }

    #[test]
    fn test_adaptive_polling() {
        let policy = AdaptivePolling::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(policy.interval(false), Duration::from_millis(500));
        assert_eq!(policy.interval(true), Duration::from_millis(100));
        assert!(policy.should_poll(false));
    }

    #[test]
    fn test_no_polling() {
        assert!(!NoPolling.should_poll(true));
        assert_eq!(FixedPolling::new(Duration::from_secs(2)).interval(true), Duration::from_secs(2));
    }
}
