//! Adaptive per-source scheduling
//!
//! Each enabled source carries a `next_due_at` deadline on the engine's
//! monotonic timeline. On startup the deadline is jittered across the
//! source's whole base interval to avoid thundering herds; after every fetch
//! outcome it is recomputed from three factors:
//!
//! - `factor_err = 2^min(5, consecutive_failures)`: exponential backoff,
//!   capped at 32x.
//! - `factor_slow = 1 + clamp((duration_ms - 1000) / 10000, 0, 2)`: slow
//!   sources are penalized up to 3x.
//! - `factor_quiet`: sources producing few fresh items wait longer, 1.0 at
//!   five or more new items on the last success, 1.5 at one to four, 2.0 at
//!   zero.
//!
//! The product is clamped to `[base, 8 * base]` and to one minute..one hour,
//! then jittered by +/-10%. A failed fetch therefore never gets an earlier
//! deadline than a success of the same duration would have received.
//!
//! The scheduler only computes deadlines; the engine's tick loop drains
//! [`AdaptiveScheduler::due`] and dispatches through its own fetch path, so
//! the single-flight guard can never be bypassed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::models::SourceDescriptor;
use crate::utils::Clock;

/// Interval clamp floor (one minute).
const MIN_INTERVAL_MS: u64 = 60_000;

/// Interval clamp ceiling (one hour).
const MAX_INTERVAL_MS: u64 = 3_600_000;

/// Backoff exponent cap (32x).
const MAX_BACKOFF_EXP: u32 = 5;

/// What the engine reports back after a fetch.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSignal {
    pub success: bool,
    pub duration_ms: u64,
    /// Committed items whose id was not in the previous cache snapshot.
    pub fresh_items: usize,
}

#[derive(Debug, Clone)]
struct SourceSchedule {
    base_ms: u64,
    priority: i32,
    adaptive: bool,
    consecutive_failures: u32,
    /// Freshness factor carried from the last successful fetch.
    quiet_factor: f64,
    interval_ms: u64,
    next_due_ms: u64,
}

/// Monitoring view of one source's schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub source_id: String,
    pub base_interval_ms: u64,
    pub current_interval_ms: u64,
    pub consecutive_failures: u32,
    pub next_due_in_ms: i64,
    pub adaptive_enabled: bool,
}

/// Deadline bookkeeping for every tracked source.
pub struct AdaptiveScheduler {
    clock: Arc<dyn Clock>,
    inner: Mutex<HashMap<String, SourceSchedule>>,
}

impl AdaptiveScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a source. The first deadline is spread uniformly over
    /// `[now, now + base)` so a restart does not fetch everything at once.
    pub fn track(&self, canonical_id: &str, descriptor: &SourceDescriptor) {
        let base = descriptor.update_interval_ms;
        let now = self.clock.monotonic_ms();
        let start_jitter = self.clock.jitter_ms(0, base as i64).max(0) as u64;
        let schedule = SourceSchedule {
            base_ms: base,
            priority: descriptor.priority,
            adaptive: descriptor.adaptive_enabled,
            consecutive_failures: 0,
            quiet_factor: 1.0,
            interval_ms: base,
            next_due_ms: now + start_jitter,
        };
        self.inner
            .lock()
            .unwrap()
            .insert(canonical_id.to_string(), schedule);
    }

    pub fn untrack(&self, canonical_id: &str) {
        self.inner.lock().unwrap().remove(canonical_id);
    }

    pub fn is_tracked(&self, canonical_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(canonical_id)
    }

    /// Recompute a source's deadline from a fetch outcome.
    pub fn on_outcome(&self, canonical_id: &str, signal: &ScheduleSignal) {
        let now = self.clock.monotonic_ms();
        let mut inner = self.inner.lock().unwrap();
        let Some(schedule) = inner.get_mut(canonical_id) else {
            return;
        };

        if signal.success {
            schedule.consecutive_failures = 0;
            schedule.quiet_factor = match signal.fresh_items {
                0 => 2.0,
                1..=4 => 1.5,
                _ => 1.0,
            };
        } else {
            schedule.consecutive_failures += 1;
        }

        let interval = if schedule.adaptive {
            let base = schedule.base_ms as f64;
            let eb = schedule.consecutive_failures.min(MAX_BACKOFF_EXP);
            let factor_err = f64::from(1u32 << eb);
            let factor_slow =
                1.0 + ((signal.duration_ms as f64 - 1000.0) / 10_000.0).clamp(0.0, 2.0);
            let factor_quiet = schedule.quiet_factor;
            let raw = base * factor_err * factor_slow * factor_quiet;
            raw.clamp(base, base * 8.0) as u64
        } else {
            schedule.base_ms
        };
        let interval = interval.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        schedule.interval_ms = interval;

        let spread = (interval / 10) as i64;
        let jitter = self.clock.jitter_ms(-spread, spread + 1);
        schedule.next_due_ms = now + interval.saturating_add_signed(jitter);

        tracing::debug!(
            source_id = %canonical_id,
            interval_ms = interval,
            failures = schedule.consecutive_failures,
            "Schedule updated"
        );
    }

    /// Sources whose deadline has elapsed, ordered by descending priority,
    /// ties broken by the oldest deadline.
    pub fn due(&self, now_ms: u64) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<(&String, &SourceSchedule)> = inner
            .iter()
            .filter(|(_, s)| s.next_due_ms <= now_ms)
            .collect();
        due.sort_by(|(_, a), (_, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_due_ms.cmp(&b.next_due_ms))
        });
        due.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// The earliest deadline across every tracked source.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|s| s.next_due_ms)
            .min()
    }

    /// Monitoring view of one source.
    pub fn status(&self, canonical_id: &str) -> Option<ScheduleStatus> {
        let now = self.clock.monotonic_ms();
        let inner = self.inner.lock().unwrap();
        inner.get(canonical_id).map(|s| ScheduleStatus {
            source_id: canonical_id.to_string(),
            base_interval_ms: s.base_ms,
            current_interval_ms: s.interval_ms,
            consecutive_failures: s.consecutive_failures,
            next_due_in_ms: s.next_due_ms as i64 - now as i64,
            adaptive_enabled: s.adaptive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use crate::utils::ManualClock;

    fn setup(base_ms: u64) -> (Arc<ManualClock>, AdaptiveScheduler) {
        let clock = Arc::new(ManualClock::new(0));
        clock.set_jitter(0);
        let scheduler = AdaptiveScheduler::new(clock.clone());
        let mut desc = SourceDescriptor::new("demo", "Demo", SourceType::Api);
        desc.update_interval_ms = base_ms;
        desc.cache_ttl_ms = 300_000;
        scheduler.track("demo", &desc);
        (clock, scheduler)
    }

    fn next_due(scheduler: &AdaptiveScheduler) -> u64 {
        scheduler.next_deadline_ms().unwrap()
    }

    #[test]
    fn test_startup_jitter_within_base() {
        let clock = Arc::new(ManualClock::new(0));
        clock.set_jitter(123_456);
        let scheduler = AdaptiveScheduler::new(clock.clone());
        let mut desc = SourceDescriptor::new("demo", "Demo", SourceType::Api);
        desc.update_interval_ms = 600_000;
        scheduler.track("demo", &desc);
        // Jitter is clamped into [0, base).
        assert!(next_due(&scheduler) < 600_000);
    }

    #[test]
    fn test_backoff_progression() {
        // S5: base 600s, three failures at 500ms each, then a fresh success.
        let (clock, scheduler) = setup(600_000);
        let fail = ScheduleSignal {
            success: false,
            duration_ms: 500,
            fresh_items: 0,
        };

        scheduler.on_outcome("demo", &fail);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 1_200_000);

        scheduler.on_outcome("demo", &fail);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 2_400_000);

        scheduler.on_outcome("demo", &fail);
        // 600s * 8 = 4800s hits the absolute one-hour ceiling.
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 3_600_000);

        let success = ScheduleSignal {
            success: true,
            duration_ms: 500,
            fresh_items: 10,
        };
        scheduler.on_outcome("demo", &success);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 600_000);
    }

    #[test]
    fn test_backoff_exponent_cap() {
        let (clock, scheduler) = setup(600_000);
        let fail = ScheduleSignal {
            success: false,
            duration_ms: 0,
            fresh_items: 0,
        };
        for _ in 0..10 {
            scheduler.on_outcome("demo", &fail);
        }
        // 2^10 would blow past every cap; 8x base wins, then the 1h ceiling.
        let delta = next_due(&scheduler) - clock.monotonic_ms();
        assert_eq!(delta, 3_600_000);
    }

    #[test]
    fn test_slow_fetch_penalty() {
        let (clock, scheduler) = setup(600_000);
        // 11 seconds: factor_slow = 1 + 1.0 = 2.0
        let slow = ScheduleSignal {
            success: true,
            duration_ms: 11_000,
            fresh_items: 10,
        };
        scheduler.on_outcome("demo", &slow);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 1_200_000);

        // factor_slow is clamped at 3x.
        let very_slow = ScheduleSignal {
            success: true,
            duration_ms: 1_000_000,
            fresh_items: 10,
        };
        scheduler.on_outcome("demo", &very_slow);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 1_800_000);
    }

    #[test]
    fn test_quiet_source_waits_longer() {
        let (clock, scheduler) = setup(600_000);

        let stale = ScheduleSignal {
            success: true,
            duration_ms: 100,
            fresh_items: 0,
        };
        scheduler.on_outcome("demo", &stale);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 1_200_000);

        let trickle = ScheduleSignal {
            success: true,
            duration_ms: 100,
            fresh_items: 3,
        };
        scheduler.on_outcome("demo", &trickle);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 900_000);

        let busy = ScheduleSignal {
            success: true,
            duration_ms: 100,
            fresh_items: 12,
        };
        scheduler.on_outcome("demo", &busy);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 600_000);
    }

    #[test]
    fn test_failure_never_due_before_equivalent_success() {
        for duration_ms in [0u64, 500, 5_000, 20_000] {
            let (_, scheduler) = setup(600_000);
            scheduler.on_outcome(
                "demo",
                &ScheduleSignal {
                    success: true,
                    duration_ms,
                    fresh_items: 10,
                },
            );
            let success_due = next_due(&scheduler);

            let (_, scheduler) = setup(600_000);
            scheduler.on_outcome(
                "demo",
                &ScheduleSignal {
                    success: false,
                    duration_ms,
                    fresh_items: 0,
                },
            );
            let failure_due = next_due(&scheduler);

            assert!(failure_due >= success_due, "duration {duration_ms}");
        }
    }

    #[test]
    fn test_non_adaptive_source_keeps_base() {
        let clock = Arc::new(ManualClock::new(0));
        clock.set_jitter(0);
        let scheduler = AdaptiveScheduler::new(clock.clone());
        let mut desc = SourceDescriptor::new("fixed", "Fixed", SourceType::Api);
        desc.update_interval_ms = 600_000;
        desc.adaptive_enabled = false;
        scheduler.track("fixed", &desc);

        let fail = ScheduleSignal {
            success: false,
            duration_ms: 30_000,
            fresh_items: 0,
        };
        scheduler.on_outcome("fixed", &fail);
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 600_000);
    }

    #[test]
    fn test_due_ordering_by_priority_then_age() {
        let clock = Arc::new(ManualClock::new(0));
        clock.set_jitter(0);
        let scheduler = AdaptiveScheduler::new(clock.clone());

        for (id, priority) in [("low", 0), ("high", 10), ("mid", 5)] {
            let mut desc = SourceDescriptor::new(id, id, SourceType::Api);
            desc.update_interval_ms = 60_000;
            desc.priority = priority;
            scheduler.track(id, &desc);
        }
        // All due immediately (startup jitter pinned to 0).
        let due = scheduler.due(clock.monotonic_ms());
        assert_eq!(due, vec!["high", "mid", "low"]);

        // Nothing due before the deadline.
        scheduler.on_outcome(
            "high",
            &ScheduleSignal {
                success: true,
                duration_ms: 0,
                fresh_items: 10,
            },
        );
        let due = scheduler.due(clock.monotonic_ms());
        assert_eq!(due, vec!["mid", "low"]);
    }

    #[test]
    fn test_jitter_spread_is_ten_percent() {
        let (clock, scheduler) = setup(600_000);
        clock.set_jitter(i64::MAX);
        scheduler.on_outcome(
            "demo",
            &ScheduleSignal {
                success: true,
                duration_ms: 0,
                fresh_items: 10,
            },
        );
        // Max positive jitter is +10% of the interval.
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 660_000);

        clock.set_jitter(i64::MIN);
        scheduler.on_outcome(
            "demo",
            &ScheduleSignal {
                success: true,
                duration_ms: 0,
                fresh_items: 10,
            },
        );
        assert_eq!(next_due(&scheduler) - clock.monotonic_ms(), 540_000);
    }

    #[test]
    fn test_untrack() {
        let (clock, scheduler) = setup(600_000);
        assert!(scheduler.is_tracked("demo"));
        scheduler.untrack("demo");
        assert!(!scheduler.is_tracked("demo"));
        assert!(scheduler.due(clock.monotonic_ms() + 10_000_000).is_empty());
    }
}
