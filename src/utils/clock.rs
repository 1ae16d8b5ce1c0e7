//! Time and randomness abstraction
//!
//! Every component that tells time takes an `Arc<dyn Clock>` so that cache
//! aging, scheduling deadlines and jitter are all testable without sleeping.
//! `SystemClock` is the production implementation; `ManualClock` is a
//! hand-advanced clock with deterministic jitter for tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Monotonic + wall time plus uniform jitter.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed on a monotonic timeline. Never goes backwards.
    fn monotonic_ms(&self) -> u64;

    /// Current wall-clock time in UTC.
    fn wall(&self) -> DateTime<Utc>;

    /// Uniform random value in `[lo, hi)`. Returns `lo` when the range is empty.
    fn jitter_ms(&self, lo: i64, hi: i64) -> i64;
}

/// Production clock backed by `std::time::Instant` and the thread RNG.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn jitter_ms(&self, lo: i64, hi: i64) -> i64 {
        if lo >= hi {
            return lo;
        }
        rand::thread_rng().gen_range(lo..hi)
    }
}

/// Hand-advanced clock for tests.
///
/// `jitter_ms` returns a fixed value clamped into the requested range, so
/// scheduling arithmetic becomes exactly reproducible.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
    jitter: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
            jitter: AtomicI64::new(0),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Pin the value returned by `jitter_ms` (clamped into the caller's range).
    pub fn set_jitter(&self, value: i64) {
        self.jitter.store(value, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn wall(&self) -> DateTime<Utc> {
        // Anchor the wall clock to the unix epoch plus the monotonic offset.
        DateTime::<Utc>::from_timestamp_millis(self.now_ms.load(Ordering::SeqCst) as i64)
            .unwrap_or_else(Utc::now)
    }

    fn jitter_ms(&self, lo: i64, hi: i64) -> i64 {
        if lo >= hi {
            return lo;
        }
        self.jitter.load(Ordering::SeqCst).clamp(lo, hi - 1)
    }
}
