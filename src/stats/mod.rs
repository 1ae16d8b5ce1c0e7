//! Per-source fetch statistics
//!
//! Each source keeps a ring of its last 256 outcomes plus live aggregates
//! split by call type (scheduler-induced `internal` vs caller-induced
//! `external`). Readers never block on recording or flushing: every record
//! publishes a fresh immutable snapshot behind an `Arc`, and readers just
//! clone the current `Arc`.
//!
//! Aggregates are flushed to the [`StatsSink`] on an interval (default 300s)
//! or immediately when an outcome fails; a flush resets the incremental
//! counters but the ring is retained.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{stats_key, SharedCache};
use crate::models::{CallType, StatsOutcome};
use crate::utils::Clock;

/// Outcomes retained per source.
pub const RING_CAPACITY: usize = 256;

/// Live aggregate for one (source, call type), reset on flush.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CallAggregate {
    pub total_requests: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
}

impl CallAggregate {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.total_requests - self.error_count) as f64 / self.total_requests as f64
    }
}

/// Reader-facing view of one (source, call type).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CallAggregateView {
    pub total_requests: u64,
    pub error_count: u64,
    pub success_rate: f64,
    /// Exact mean duration over the outcomes of this call type in the ring.
    pub avg_duration_ms: f64,
}

/// Immutable per-source snapshot published on every record.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub source_id: String,
    pub generated_at: DateTime<Utc>,
    pub internal: CallAggregateView,
    pub external: CallAggregateView,
    pub last_error: Option<String>,
    pub last_item_count: usize,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl SourceSnapshot {
    pub fn by_call_type(&self, call_type: CallType) -> &CallAggregateView {
        match call_type {
            CallType::Internal => &self.internal,
            CallType::External => &self.external,
        }
    }
}

/// Row handed to the sink's source-status upsert.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatusRow {
    pub status: String,
    pub last_error: Option<String>,
    pub last_update: DateTime<Utc>,
    pub item_count: usize,
}

/// Persistence boundary for stats. The engine does not care what is behind
/// it (relational DB, time-series store, ...).
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn append_outcome(&self, outcome: &StatsOutcome);
    async fn upsert_aggregate(
        &self,
        source_id: &str,
        call_type: CallType,
        aggregate: &CallAggregateView,
    );
    async fn upsert_source_status(&self, source_id: &str, status: &SourceStatusRow);
}

/// Sink that drops everything (running without persistence).
pub struct NullStatsSink;

#[async_trait]
impl StatsSink for NullStatsSink {
    async fn append_outcome(&self, _outcome: &StatsOutcome) {}
    async fn upsert_aggregate(
        &self,
        _source_id: &str,
        _call_type: CallType,
        _aggregate: &CallAggregateView,
    ) {
    }
    async fn upsert_source_status(&self, _source_id: &str, _status: &SourceStatusRow) {}
}

/// Capturing sink for tests.
#[derive(Default)]
pub struct MemoryStatsSink {
    pub outcomes: Mutex<Vec<StatsOutcome>>,
    pub aggregates: Mutex<Vec<(String, CallType, CallAggregateView)>>,
    pub statuses: Mutex<Vec<(String, SourceStatusRow)>>,
}

#[async_trait]
impl StatsSink for MemoryStatsSink {
    async fn append_outcome(&self, outcome: &StatsOutcome) {
        self.outcomes.lock().unwrap().push(outcome.clone());
    }

    async fn upsert_aggregate(
        &self,
        source_id: &str,
        call_type: CallType,
        aggregate: &CallAggregateView,
    ) {
        self.aggregates
            .lock()
            .unwrap()
            .push((source_id.to_string(), call_type, *aggregate));
    }

    async fn upsert_source_status(&self, source_id: &str, status: &SourceStatusRow) {
        self.statuses
            .lock()
            .unwrap()
            .push((source_id.to_string(), status.clone()));
    }
}

/// Recording state for one source.
#[derive(Debug, Default)]
struct SourceStats {
    ring: VecDeque<StatsOutcome>,
    internal: CallAggregate,
    external: CallAggregate,
    last_error: Option<String>,
    last_item_count: usize,
    last_success_at: Option<DateTime<Utc>>,
}

impl SourceStats {
    fn aggregate_mut(&mut self, call_type: CallType) -> &mut CallAggregate {
        match call_type {
            CallType::Internal => &mut self.internal,
            CallType::External => &mut self.external,
        }
    }

    fn view(&self, call_type: CallType) -> CallAggregateView {
        let aggregate = match call_type {
            CallType::Internal => &self.internal,
            CallType::External => &self.external,
        };
        let (count, sum) = self
            .ring
            .iter()
            .filter(|o| o.call_type == call_type)
            .fold((0u64, 0u64), |(c, s), o| (c + 1, s + o.duration_ms));
        CallAggregateView {
            total_requests: aggregate.total_requests,
            error_count: aggregate.error_count,
            success_rate: aggregate.success_rate(),
            avg_duration_ms: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
        }
    }

    fn snapshot(&self, source_id: &str, now: DateTime<Utc>) -> SourceSnapshot {
        SourceSnapshot {
            source_id: source_id.to_string(),
            generated_at: now,
            internal: self.view(CallType::Internal),
            external: self.view(CallType::External),
            last_error: self.last_error.clone(),
            last_item_count: self.last_item_count,
            last_success_at: self.last_success_at,
        }
    }
}

/// Collector of per-source fetch outcomes.
pub struct StatsCollector {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn StatsSink>,
    shared: Option<Arc<dyn SharedCache>>,
    flush_interval: Duration,
    inner: Mutex<HashMap<String, SourceStats>>,
    snapshots: RwLock<Arc<HashMap<String, Arc<SourceSnapshot>>>>,
    last_flush_ms: AtomicU64,
}

impl StatsCollector {
    pub fn new(
        clock: Arc<dyn Clock>,
        sink: Arc<dyn StatsSink>,
        shared: Option<Arc<dyn SharedCache>>,
        flush_interval: Duration,
    ) -> Self {
        let start = clock.monotonic_ms();
        Self {
            clock,
            sink,
            shared,
            flush_interval,
            inner: Mutex::new(HashMap::new()),
            snapshots: RwLock::new(Arc::new(HashMap::new())),
            last_flush_ms: AtomicU64::new(start),
        }
    }

    /// Record one outcome.
    ///
    /// Appends to the ring, updates the incremental aggregates, publishes a
    /// fresh snapshot, and forwards the row to the sink. A failed outcome
    /// triggers an immediate flush.
    pub async fn record(&self, outcome: StatsOutcome) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let stats = inner.entry(outcome.source_id.clone()).or_default();

            if stats.ring.len() == RING_CAPACITY {
                stats.ring.pop_front();
            }

            let aggregate = stats.aggregate_mut(outcome.call_type);
            aggregate.total_requests += 1;
            aggregate.total_duration_ms += outcome.duration_ms;
            if !outcome.success {
                aggregate.error_count += 1;
                stats.last_error = outcome.error_message.clone();
            } else {
                stats.last_success_at = Some(outcome.started_at);
            }
            stats.last_item_count = outcome.item_count;
            stats.ring.push_back(outcome.clone());

            Arc::new(stats.snapshot(&outcome.source_id, self.clock.wall()))
        };
        self.publish(snapshot);

        self.sink.append_outcome(&outcome).await;

        let elapsed = self
            .clock
            .monotonic_ms()
            .saturating_sub(self.last_flush_ms.load(Ordering::SeqCst));
        if !outcome.success || elapsed >= self.flush_interval.as_millis() as u64 {
            self.flush().await;
        }
    }

    /// Swap the published snapshot map. Readers cloning the old `Arc` keep a
    /// consistent view; nobody blocks on this swap for long.
    fn publish(&self, snapshot: Arc<SourceSnapshot>) {
        let mut guard = self.snapshots.write().unwrap();
        let mut map = (**guard).clone();
        map.insert(snapshot.source_id.clone(), snapshot);
        *guard = Arc::new(map);
    }

    /// Current snapshot for one source.
    pub fn snapshot(&self, source_id: &str) -> Option<Arc<SourceSnapshot>> {
        self.snapshots.read().unwrap().get(source_id).cloned()
    }

    /// Current snapshots for every source.
    pub fn all_snapshots(&self) -> Arc<HashMap<String, Arc<SourceSnapshot>>> {
        Arc::clone(&self.snapshots.read().unwrap())
    }

    /// Serialize aggregates to the sink and reset the incremental counters.
    pub async fn flush(&self) {
        self.last_flush_ms
            .store(self.clock.monotonic_ms(), Ordering::SeqCst);

        let rows: Vec<(String, SourceSnapshot)> = {
            let mut inner = self.inner.lock().unwrap();
            let now = self.clock.wall();
            inner
                .iter_mut()
                .map(|(source_id, stats)| {
                    let snapshot = stats.snapshot(source_id, now);
                    stats.internal = CallAggregate::default();
                    stats.external = CallAggregate::default();
                    (source_id.clone(), snapshot)
                })
                .collect()
        };

        for (source_id, snapshot) in rows {
            // Skip sources with no traffic since the previous flush.
            if snapshot.internal.total_requests == 0 && snapshot.external.total_requests == 0 {
                continue;
            }
            self.sink
                .upsert_aggregate(&source_id, CallType::Internal, &snapshot.internal)
                .await;
            self.sink
                .upsert_aggregate(&source_id, CallType::External, &snapshot.external)
                .await;

            let status = SourceStatusRow {
                status: if snapshot.last_error.is_some() {
                    "error".to_string()
                } else {
                    "ok".to_string()
                },
                last_error: snapshot.last_error.clone(),
                last_update: snapshot.generated_at,
                item_count: snapshot.last_item_count,
            };
            self.sink.upsert_source_status(&source_id, &status).await;

            // Aggregate snapshot for fast dashboards.
            if let Some(shared) = &self.shared {
                if let Ok(bytes) = serde_json::to_vec(&snapshot) {
                    shared
                        .set(&stats_key(&source_id), bytes, self.flush_interval.as_millis() as u64 * 2)
                        .await;
                }
            }
        }
        tracing::debug!("Stats flushed");
    }

    /// Spawn the periodic flush task.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let collector = Arc::clone(self);
        let interval = collector.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                collector.flush().await;
            }
        })
    }
}
