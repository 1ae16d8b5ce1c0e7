//! The fetch engine
//!
//! Orchestrates everything: canonical-id resolution, the two-tier cache, the
//! per-source single-flight guard, proxy-aware client construction, adapter
//! invocation under a deadline, cache-update protection, stats recording,
//! adaptive rescheduling and downstream emission.
//!
//! Two entry points exist. [`FetchEngine::get_news`] serves callers: it
//! prefers a valid cache entry, coalesces concurrent requests behind one
//! leader fetch, and hides errors behind cached items when it has any.
//! [`FetchEngine::fetch_source`] serves the background scheduler: it always
//! fetches (a tick that finds the source in flight is a no-op) and returns
//! only the recorded outcome.
//!
//! The leader fetch runs on a detached task: a caller abandoning `get_news`
//! never cancels the fetch other waiters and the scheduler benefit from.

pub mod flight;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Semaphore};

use crate::cache::{CacheStatus, SourceCache};
use crate::client::{ClientFactory, PreparedClient};
use crate::config::EngineConfig;
use crate::emit::Emitter;
use crate::error::{ErrorKind, FetchError, Result};
use crate::models::{CallType, NewsItem, SourceDescriptor, StatsOutcome};
use crate::proxy::{ProxyPool, ProxyStatusView};
use crate::scheduler::{AdaptiveScheduler, ScheduleSignal, ScheduleStatus};
use crate::source::{build_adapter, Renderer, RendererPool, SourceAdapter, SourceRegistry};
use crate::stats::{SourceSnapshot, StatsCollector, StatsSink};
use crate::utils::Clock;

pub use flight::FetchMeta;
use flight::{FlightLeader, FlightOutcome, FlightRole, SharedOutcome, SingleFlight};

/// Options for [`FetchEngine::get_news`].
#[derive(Debug, Clone, Default)]
pub struct GetNewsOptions {
    /// Skip the cache-validity check and force a live fetch.
    pub force_refresh: bool,
    /// Caller deadline. Waiters give up (and fall back to cached items) when
    /// it elapses; the leader fetch itself is not canceled.
    pub timeout: Option<Duration>,
    /// Override the recorded call type (defaults to `external`).
    pub call_type: Option<CallType>,
}

/// Control-plane view of one source.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatusView {
    pub descriptor: SourceDescriptor,
    pub cache: Option<CacheStatus>,
    pub schedule: Option<ScheduleStatus>,
    pub stats: Option<SourceSnapshot>,
    pub in_flight: bool,
}

/// The engine handle. Construct once, share via `Arc`.
pub struct FetchEngine {
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    registry: SourceRegistry,
    cache: SourceCache,
    proxies: Arc<ProxyPool>,
    clients: ClientFactory,
    stats: Arc<StatsCollector>,
    scheduler: AdaptiveScheduler,
    emitter: Arc<dyn Emitter>,
    renderers: Option<Arc<RendererPool>>,
    flight: Arc<SingleFlight>,
    permits: Arc<Semaphore>,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl FetchEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn StatsSink>,
        emitter: Arc<dyn Emitter>,
        shared: Option<Arc<dyn crate::cache::SharedCache>>,
        renderer: Option<Arc<dyn Renderer>>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let proxies = Arc::new(ProxyPool::new(Arc::clone(&clock)));
        proxies.set_required_domains(config.proxy_required_domains.clone());
        let clients = ClientFactory::new(Arc::clone(&config), Arc::clone(&proxies));
        let cache = SourceCache::new(Arc::clone(&clock), shared.clone());
        let stats = Arc::new(StatsCollector::new(
            Arc::clone(&clock),
            sink,
            shared,
            Duration::from_secs(config.stats_flush_secs),
        ));
        let scheduler = AdaptiveScheduler::new(Arc::clone(&clock));
        let renderers =
            renderer.map(|r| Arc::new(RendererPool::new(r, config.renderer_pool_size)));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_fetches));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            clock,
            registry: SourceRegistry::new(),
            cache,
            proxies,
            clients,
            stats,
            scheduler,
            emitter,
            renderers,
            flight: Arc::new(SingleFlight::new()),
            permits,
            accepting: AtomicBool::new(true),
            shutdown_tx,
            config,
        })
    }

    // ========================================================================
    // Control plane
    // ========================================================================

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an adapter and start scheduling it.
    pub fn register(&self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        self.registry.register(Arc::clone(&adapter))?;
        let canonical = self.registry.canonicalize(&adapter.descriptor().source_id);
        self.scheduler.track(&canonical, adapter.descriptor());
        Ok(())
    }

    /// Build the matching adapter for a descriptor and register it.
    ///
    /// Descriptors that omit their intervals inherit the engine defaults.
    pub fn register_descriptor(&self, mut descriptor: SourceDescriptor) -> Result<()> {
        if descriptor.update_interval_ms == 0 {
            descriptor.update_interval_ms = self.config.default_update_interval_ms;
        }
        if descriptor.cache_ttl_ms == 0 {
            descriptor.cache_ttl_ms = self.config.default_cache_ttl_ms;
        }
        let adapter = build_adapter(descriptor, self.renderers.clone())?;
        self.register(adapter)
    }

    /// Remove a source: stop scheduling, drop its cache, close the adapter.
    pub async fn deregister(&self, source_id: &str) -> bool {
        let canonical = self.registry.canonicalize(source_id);
        let Some(adapter) = self.registry.deregister(&canonical) else {
            return false;
        };
        self.scheduler.untrack(&canonical);
        self.cache.clear(&canonical).await;
        adapter.close().await;
        true
    }

    /// Swap a source's configuration. Takes effect on the next fetch; the
    /// cache entry survives the swap.
    pub fn update_source(&self, descriptor: SourceDescriptor) -> Result<()> {
        let adapter = build_adapter(descriptor, self.renderers.clone())?;
        let canonical = adapter.descriptor().canonical_id();
        if !self.registry.contains(&canonical) {
            return Err(crate::error::Error::registry(format!(
                "cannot update unregistered source '{canonical}'"
            )));
        }
        self.scheduler.track(&canonical, adapter.descriptor());
        self.registry.replace(adapter);
        Ok(())
    }

    pub fn list_sources(&self) -> Vec<SourceDescriptor> {
        self.registry.list()
    }

    pub fn source_status(&self, source_id: &str) -> Option<SourceStatusView> {
        let canonical = self.registry.canonicalize(source_id);
        let adapter = self.registry.resolve(&canonical)?;
        Some(SourceStatusView {
            descriptor: adapter.descriptor().clone(),
            cache: self.cache.status(&canonical),
            schedule: self.scheduler.status(&canonical),
            stats: self.stats.snapshot(&canonical).map(|s| (*s).clone()),
            in_flight: self.flight.in_flight(&canonical),
        })
    }

    pub fn proxy_status(&self) -> Vec<ProxyStatusView> {
        self.proxies.status()
    }

    /// Drop a source's cache entry (admin action; TTL alone never evicts).
    pub async fn clear_cache(&self, source_id: &str) {
        let canonical = self.registry.canonicalize(source_id);
        self.cache.clear(&canonical).await;
    }

    /// On-demand forced refresh (control plane).
    pub async fn refresh(
        self: &Arc<Self>,
        source_id: &str,
    ) -> std::result::Result<(Vec<NewsItem>, FetchMeta), FetchError> {
        self.get_news(
            source_id,
            GetNewsOptions {
                force_refresh: true,
                ..Default::default()
            },
        )
        .await
    }

    // ========================================================================
    // Public fetch paths
    // ========================================================================

    /// Fetch a source's items on behalf of a caller.
    pub async fn get_news(
        self: &Arc<Self>,
        source_id: &str,
        options: GetNewsOptions,
    ) -> std::result::Result<(Vec<NewsItem>, FetchMeta), FetchError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(FetchError::Canceled);
        }
        let canonical = self.registry.canonicalize(source_id);
        let Some(adapter) = self.registry.resolve(&canonical) else {
            return Err(FetchError::UnknownSource(canonical));
        };
        let descriptor = adapter.descriptor().clone();
        let call_type = options.call_type.unwrap_or(CallType::External);

        if !options.force_refresh {
            if let Some(lookup) = self.cache.lookup(&canonical, descriptor.cache_ttl_ms) {
                if lookup.valid {
                    return Ok((
                        lookup.items,
                        FetchMeta {
                            cache_hit: true,
                            age_ms: lookup.age_ms,
                            ..Default::default()
                        },
                    ));
                }
            } else if self.cache.restore_from_shared(&canonical).await {
                if let Some(lookup) = self.cache.lookup(&canonical, descriptor.cache_ttl_ms) {
                    if lookup.valid {
                        return Ok((
                            lookup.items,
                            FetchMeta {
                                cache_hit: true,
                                age_ms: lookup.age_ms,
                                ..Default::default()
                            },
                        ));
                    }
                }
            }
        }

        let effective = self.effective_deadline(&descriptor, options.timeout);
        let rx = match self.flight.begin(&canonical) {
            FlightRole::Leader(leader) => {
                let rx = leader.subscribe();
                self.spawn_leader(leader, canonical.clone(), adapter, call_type, effective);
                rx
            }
            FlightRole::Follower(rx) => rx,
        };
        self.await_outcome(rx, &canonical, &descriptor, options.timeout)
            .await
    }

    /// Scheduler entry point: run one fetch, return the recorded outcome.
    ///
    /// Never bypasses the single-flight guard: finding the source in flight
    /// makes this tick a no-op (`None`), and its due time is not advanced.
    pub async fn fetch_source(
        self: &Arc<Self>,
        source_id: &str,
        call_type: CallType,
    ) -> Option<StatsOutcome> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        let canonical = self.registry.canonicalize(source_id);
        let Some(adapter) = self.registry.resolve(&canonical) else {
            tracing::warn!(source_id = %canonical, "Scheduled source is not registered");
            return None;
        };
        let descriptor = adapter.descriptor().clone();
        let effective = self.effective_deadline(&descriptor, None);

        match self.flight.begin(&canonical) {
            FlightRole::Follower(_) => None,
            FlightRole::Leader(leader) => {
                let (shared, outcome) = self
                    .lead_fetch(&canonical, adapter, call_type, effective)
                    .await;
                leader.complete(shared);
                Some(outcome)
            }
        }
    }

    // ========================================================================
    // Leader internals
    // ========================================================================

    fn effective_deadline(
        &self,
        descriptor: &SourceDescriptor,
        caller_timeout: Option<Duration>,
    ) -> Duration {
        let source_deadline =
            Duration::from_millis(descriptor.fetch_deadline_ms(self.config.fetch_deadline_ms));
        match caller_timeout {
            Some(timeout) => timeout.min(source_deadline),
            None => source_deadline,
        }
    }

    fn spawn_leader(
        self: &Arc<Self>,
        leader: FlightLeader,
        canonical: String,
        adapter: Arc<dyn SourceAdapter>,
        call_type: CallType,
        effective: Duration,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let (shared, _outcome) = engine
                .lead_fetch(&canonical, adapter, call_type, effective)
                .await;
            leader.complete(shared);
        });
    }

    /// Wait for the in-flight result within the caller's deadline. A waiter
    /// timing out gets the most recent cached items if any exist, else
    /// `in_flight_timeout`.
    async fn await_outcome(
        &self,
        mut rx: broadcast::Receiver<SharedOutcome>,
        canonical: &str,
        descriptor: &SourceDescriptor,
        caller_timeout: Option<Duration>,
    ) -> std::result::Result<(Vec<NewsItem>, FetchMeta), FetchError> {
        // Without an explicit caller deadline, wait slightly past the fetch
        // deadline so the leader's own timeout resolves the flight first.
        let wait = caller_timeout.unwrap_or_else(|| {
            Duration::from_millis(descriptor.fetch_deadline_ms(self.config.fetch_deadline_ms))
                + Duration::from_secs(5)
        });

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Ok(outcome)) => match &outcome.result {
                Ok((items, meta)) => Ok((items.clone(), meta.clone())),
                Err((kind, message)) => Err(FetchError::from_kind(*kind, message)),
            },
            Ok(Err(_closed)) => Err(FetchError::AdapterInternal(
                "fetch result channel closed".to_string(),
            )),
            Err(_elapsed) => match self.cache.lookup(canonical, u64::MAX) {
                Some(lookup) if !lookup.items.is_empty() => Ok((
                    lookup.items,
                    FetchMeta {
                        cache_hit: true,
                        age_ms: lookup.age_ms,
                        error_kind: Some(ErrorKind::InFlightTimeout),
                        ..Default::default()
                    },
                )),
                _ => Err(FetchError::InFlightTimeout),
            },
        }
    }

    /// The leader fetch: client, adapter, protection, stats, schedule, emit.
    async fn lead_fetch(
        &self,
        canonical: &str,
        adapter: Arc<dyn SourceAdapter>,
        call_type: CallType,
        effective: Duration,
    ) -> (SharedOutcome, StatsOutcome) {
        let descriptor = adapter.descriptor().clone();
        let started_at = self.clock.wall();

        // The duration clock starts once a fetch slot is held; queueing on
        // the global semaphore is not the source's fault.
        let (fetch_result, duration_ms) = match self.permits.acquire().await {
            Ok(_permit) => {
                let t0 = self.clock.monotonic_ms();
                // The effective deadline bounds the whole attempt, proxy
                // failover retry included.
                let result = match tokio::time::timeout(
                    effective,
                    self.attempt_fetch(&descriptor, &adapter, effective),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout),
                };
                (result, self.clock.monotonic_ms().saturating_sub(t0))
            }
            Err(_closed) => (Err(FetchError::Canceled), 0),
        };

        let (success, items, error) = match fetch_result {
            Ok(items) => (true, self.normalize(&descriptor, canonical, items), None),
            Err(e) => (false, Vec::new(), Some(e)),
        };
        let error_kind = error.as_ref().map(FetchError::kind);
        let error_message = error
            .as_ref()
            .map(|e| StatsOutcome::truncate_message(&e.to_string()));

        let update = self
            .cache
            .update(
                canonical,
                items,
                success,
                error_message.as_deref(),
                descriptor.shrink_threshold(),
                descriptor.cache_ttl_ms,
            )
            .await;

        let outcome = StatsOutcome {
            source_id: canonical.to_string(),
            started_at,
            duration_ms,
            success,
            item_count: update.committed.len(),
            cache_used: update.protection.is_some(),
            error_kind,
            error_message: error_message.clone(),
            call_type,
        };
        self.stats.record(outcome.clone()).await;

        self.scheduler.on_outcome(
            canonical,
            &ScheduleSignal {
                success,
                duration_ms,
                fresh_items: update.fresh,
            },
        );

        // Emission happens only when the live fetch committed new items;
        // cache hits and protection-served results do not re-emit.
        if update.replaced && !update.committed.is_empty() {
            match tokio::time::timeout(
                self.config.emit_deadline(),
                self.emitter.emit(canonical, &update.committed, call_type),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(source_id = %canonical, error = %e, "Downstream emit failed")
                }
                Err(_) => {
                    tracing::warn!(source_id = %canonical, "Downstream emit timed out")
                }
            }
        }

        let meta = FetchMeta {
            cache_hit: false,
            protection_applied: update.protection.is_some(),
            age_ms: 0,
            error_kind,
        };

        // Errors are hidden behind cached items; a cold cache propagates the
        // typed error to the caller.
        let result = if success || !update.committed.is_empty() {
            Ok((update.committed, meta))
        } else {
            Err((
                error_kind.unwrap_or(ErrorKind::AdapterInternal),
                error_message.unwrap_or_default(),
            ))
        };
        (Arc::new(FlightOutcome { result }), outcome)
    }

    /// One adapter invocation, with a single proxy-failover retry.
    async fn attempt_fetch(
        &self,
        descriptor: &SourceDescriptor,
        adapter: &Arc<dyn SourceAdapter>,
        effective: Duration,
    ) -> std::result::Result<Vec<NewsItem>, FetchError> {
        let prepared = self.clients.build(descriptor, None)?;
        let (result, latency_ms) = self.timed_fetch(adapter, &prepared, effective).await;

        let proxied_network_error = prepared.proxy_id().is_some()
            && matches!(
                result.as_ref().err().map(FetchError::kind),
                Some(ErrorKind::Network | ErrorKind::Timeout)
            );
        if let Some(proxy_id) = prepared.proxy_id() {
            self.proxies.report(proxy_id, result.is_ok(), latency_ms);
        }
        if !proxied_network_error {
            return result;
        }

        let failed_id = prepared.proxy_id().unwrap_or_default().to_string();
        tracing::warn!(
            source_id = %descriptor.source_id,
            proxy_id = %failed_id,
            "Fetch failed via proxy, retrying with the next one"
        );
        let retry = match self.clients.build(descriptor, Some(&failed_id)) {
            Ok(retry) => retry,
            // No further proxy: surface the original failure.
            Err(_) => return result,
        };
        let (second, latency_ms) = self.timed_fetch(adapter, &retry, effective).await;
        if let Some(proxy_id) = retry.proxy_id() {
            self.proxies.report(proxy_id, second.is_ok(), latency_ms);
        }
        second
    }

    async fn timed_fetch(
        &self,
        adapter: &Arc<dyn SourceAdapter>,
        prepared: &PreparedClient,
        effective: Duration,
    ) -> (std::result::Result<Vec<NewsItem>, FetchError>, u64) {
        let t0 = self.clock.monotonic_ms();
        let result = match tokio::time::timeout(effective, adapter.fetch(&prepared.client)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };
        (result, self.clock.monotonic_ms().saturating_sub(t0))
    }

    /// Normalize adapter output on ingest: top-level identity fields, derived
    /// ids, no identity keys inside `extra`, bounded item count.
    fn normalize(
        &self,
        descriptor: &SourceDescriptor,
        canonical: &str,
        items: Vec<NewsItem>,
    ) -> Vec<NewsItem> {
        let cap = self.config.max_items_per_source;
        let mut out = Vec::with_capacity(items.len().min(cap));
        for mut item in items {
            item.source_id = canonical.to_string();
            item.source_name = descriptor.name.clone();
            item.extra.remove("source_id");
            item.extra.remove("source_name");
            item.ensure_id();
            out.push(item);
            if out.len() == cap {
                tracing::debug!(source_id = %canonical, cap, "Item list truncated at ingest cap");
                break;
            }
        }
        out
    }

    // ========================================================================
    // Background scheduling and shutdown
    // ========================================================================

    /// The scheduler tick loop. Wakes every second (or at the earliest due
    /// deadline, whichever is sooner), dispatches due sources by descending
    /// priority as `internal` calls, and exits on shutdown.
    pub async fn run_scheduler(self: &Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!("Scheduler loop started");
        loop {
            let now = self.clock.monotonic_ms();
            for source_id in self.scheduler.due(now) {
                if self.flight.in_flight(&source_id) {
                    continue; // skipped without penalty, deadline untouched
                }
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.fetch_source(&source_id, CallType::Internal).await;
                });
            }

            let sleep_ms = self
                .scheduler
                .next_deadline_ms()
                .map(|deadline| deadline.saturating_sub(self.clock.monotonic_ms()))
                .unwrap_or(1_000)
                .clamp(10, 1_000);
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
        }
        tracing::info!("Scheduler loop stopped");
    }

    /// Spawn every background task: the scheduler loop, the stats flusher
    /// and the proxy health sweep (plus renderer recycling when configured).
    pub fn spawn_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let engine = Arc::clone(self);
        handles.push(tokio::spawn(async move { engine.run_scheduler().await }));
        handles.push(self.stats.spawn_flusher());
        handles.push(
            self.proxies
                .spawn_sweeper(Duration::from_secs(self.config.proxy_sweep_secs)),
        );
        if let Some(renderers) = &self.renderers {
            handles.push(renderers.spawn_recycler());
        }
        handles
    }

    /// Graceful shutdown: stop accepting work, drain in-flight fetches for
    /// up to `shutdown_grace_ms`, release adapters and renderers, flush
    /// stats one last time.
    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let deadline = self.clock.monotonic_ms() + self.config.shutdown_grace_ms;
        while self.flight.active() > 0 && self.clock.monotonic_ms() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.flight.active() > 0 {
            tracing::warn!(
                remaining = self.flight.active(),
                "Shutdown grace elapsed with fetches still in flight"
            );
        }
        // Cancel anything still queued on the fetch semaphore.
        self.permits.close();

        self.registry.close_all().await;
        if let Some(renderers) = &self.renderers {
            renderers.shutdown().await;
        }
        self.stats.flush().await;
        tracing::info!("Engine shutdown complete");
    }
}
