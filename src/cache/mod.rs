//! Per-source cache with protection heuristics
//!
//! The in-memory per-source cache is authoritative for the engine's
//! protection logic. Transient outages and API rate limits degrade silently
//! on the wire, so a fetch that comes back empty, errored or dramatically
//! shrunken must not wipe a known-good entry; the protection policy keeps the
//! existing items and counts the event instead.
//!
//! Entries are created lazily on the first successful fetch, mutated only
//! inside the per-source single-flight guard, and never evicted by TTL alone
//! (TTL only decides whether a caller may use them).

pub mod shared;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::models::NewsItem;
use crate::utils::Clock;

pub use shared::{items_key, stats_key, MemorySharedCache, RedisSharedCache, SharedCache};

/// Which protection rule fired on an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    /// Successful fetch returned zero items against a warm cache.
    Empty,
    /// Fetch failed against a warm cache.
    Error,
    /// Successful fetch returned dramatically fewer items than cached.
    Shrink,
}

/// Per-source protection event counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProtectionCounters {
    pub empty_protection_count: u64,
    pub error_protection_count: u64,
    pub shrink_protection_count: u64,
}

impl ProtectionCounters {
    pub fn total(&self) -> u64 {
        self.empty_protection_count + self.error_protection_count + self.shrink_protection_count
    }
}

/// In-memory cache record for one source.
#[derive(Debug, Default)]
struct CacheEntry {
    items: Vec<NewsItem>,
    fetched_at_ms: u64,
    has_data: bool,
    last_error: Option<String>,
    protection: ProtectionCounters,
    hit_count: u64,
    miss_count: u64,
    max_size_seen: usize,
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub items: Vec<NewsItem>,
    pub age_ms: u64,
    /// `present && age_ms <= ttl`.
    pub valid: bool,
}

/// Result of a cache update: what callers will observe.
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    /// The committed items: either the new items or the protected old ones.
    pub committed: Vec<NewsItem>,
    /// The protection rule that fired, if any.
    pub protection: Option<Protection>,
    /// Whether the entry was replaced with the new items.
    pub replaced: bool,
    /// Count of committed items whose id was not in the previous snapshot.
    pub fresh: usize,
}

/// Monitoring snapshot for one source's cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub source_id: String,
    pub item_count: usize,
    pub has_data: bool,
    pub age_ms: u64,
    pub last_error: Option<String>,
    pub protection: ProtectionCounters,
    pub hit_count: u64,
    pub miss_count: u64,
    pub max_size_seen: usize,
}

/// Per-source in-memory cache with an optional shared second tier.
pub struct SourceCache {
    clock: Arc<dyn Clock>,
    shared: Option<Arc<dyn SharedCache>>,
    // Fine-grained locking: the outer map lock is held only to find the
    // per-source entry; entry mutations take the per-entry mutex. Neither
    // lock is ever held across an await point.
    entries: RwLock<HashMap<String, Arc<Mutex<CacheEntry>>>>,
}

impl SourceCache {
    pub fn new(clock: Arc<dyn Clock>, shared: Option<Arc<dyn SharedCache>>) -> Self {
        Self {
            clock,
            shared,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, source_id: &str) -> Arc<Mutex<CacheEntry>> {
        if let Some(entry) = self.entries.read().unwrap().get(source_id) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().unwrap();
        Arc::clone(entries.entry(source_id.to_string()).or_default())
    }

    /// Whether any in-memory entry exists for the source (even an empty one).
    pub fn has_entry(&self, source_id: &str) -> bool {
        self.entries.read().unwrap().contains_key(source_id)
    }

    /// Look up the cached items for a source.
    ///
    /// Returns `None` when no data has ever been committed. Increments the
    /// hit counter when the entry is valid under `ttl_ms`, the miss counter
    /// otherwise.
    pub fn lookup(&self, source_id: &str, ttl_ms: u64) -> Option<CacheLookup> {
        // Never creates an entry: entries come into existence on update, so
        // the shared-tier cold-start check can rely on `has_entry`.
        let entry = {
            let entries = self.entries.read().unwrap();
            Arc::clone(entries.get(source_id)?)
        };
        let mut entry = entry.lock().unwrap();
        if !entry.has_data {
            entry.miss_count += 1;
            return None;
        }
        let age_ms = self.clock.monotonic_ms().saturating_sub(entry.fetched_at_ms);
        let valid = age_ms <= ttl_ms;
        if valid {
            entry.hit_count += 1;
        } else {
            entry.miss_count += 1;
        }
        Some(CacheLookup {
            items: entry.items.clone(),
            age_ms,
            valid,
        })
    }

    /// Commit a fetch result through the protection policy and, when the
    /// entry was replaced, publish it to the shared tier.
    pub async fn update(
        &self,
        source_id: &str,
        new_items: Vec<NewsItem>,
        success: bool,
        error: Option<&str>,
        shrink_threshold: f64,
        shared_ttl_ms: u64,
    ) -> CacheUpdate {
        let update = self.apply(source_id, new_items, success, error, shrink_threshold);
        if update.replaced && !update.committed.is_empty() {
            if let Some(shared) = &self.shared {
                match serde_json::to_vec(&update.committed) {
                    Ok(bytes) => {
                        shared.set(&items_key(source_id), bytes, shared_ttl_ms).await;
                    }
                    Err(e) => {
                        tracing::warn!(source_id = %source_id, error = %e, "Failed to serialize items for shared cache");
                    }
                }
            }
        }
        update
    }

    /// The protection decision table. Synchronous: locks are released before
    /// any shared-tier I/O.
    fn apply(
        &self,
        source_id: &str,
        new_items: Vec<NewsItem>,
        success: bool,
        error: Option<&str>,
        shrink_threshold: f64,
    ) -> CacheUpdate {
        let entry = self.entry(source_id);
        let mut entry = entry.lock().unwrap();
        let cur_count = entry.items.len();
        let new_count = new_items.len();

        if !success {
            if cur_count > 0 {
                entry.protection.error_protection_count += 1;
                entry.last_error = error.map(|e| e.to_string());
                tracing::warn!(
                    source_id = %source_id,
                    cached = cur_count,
                    "Fetch failed, serving existing cache"
                );
                return CacheUpdate {
                    committed: entry.items.clone(),
                    protection: Some(Protection::Error),
                    replaced: false,
                    fresh: 0,
                };
            }
            // Cold cache: stay empty and remember the error. `has_data`
            // stays false so the next call fetches again instead of being
            // served a failed empty entry.
            entry.items = Vec::new();
            entry.fetched_at_ms = self.clock.monotonic_ms();
            entry.last_error = error.map(|e| e.to_string());
            return CacheUpdate {
                committed: Vec::new(),
                protection: None,
                replaced: true,
                fresh: 0,
            };
        }

        if new_count == 0 && cur_count > 0 {
            entry.protection.empty_protection_count += 1;
            tracing::warn!(
                source_id = %source_id,
                cached = cur_count,
                "Empty result against warm cache, keeping existing items"
            );
            return CacheUpdate {
                committed: entry.items.clone(),
                protection: Some(Protection::Empty),
                replaced: false,
                fresh: 0,
            };
        }

        // Small caches are allowed to swing freely: shrink protection only
        // ever fires above 5 cached items.
        if cur_count > 5 && (new_count as f64) < shrink_threshold * cur_count as f64 {
            entry.protection.shrink_protection_count += 1;
            tracing::warn!(
                source_id = %source_id,
                cached = cur_count,
                fetched = new_count,
                "Result shrank below threshold, keeping existing items"
            );
            return CacheUpdate {
                committed: entry.items.clone(),
                protection: Some(Protection::Shrink),
                replaced: false,
                fresh: 0,
            };
        }

        let previous_ids: HashSet<&str> = entry.items.iter().map(|i| i.id.as_str()).collect();
        let fresh = new_items
            .iter()
            .filter(|i| !previous_ids.contains(i.id.as_str()))
            .count();
        drop(previous_ids);

        entry.items = new_items;
        entry.has_data = true;
        entry.fetched_at_ms = self.clock.monotonic_ms();
        entry.last_error = None;
        if entry.items.len() > entry.max_size_seen {
            entry.max_size_seen = entry.items.len();
        }
        CacheUpdate {
            committed: entry.items.clone(),
            protection: None,
            replaced: true,
            fresh,
        }
    }

    /// Seed a cold in-memory entry from the shared tier.
    ///
    /// Only attempted when no in-memory entry exists; the shared tier never
    /// overrides live state. Returns whether anything was restored.
    pub async fn restore_from_shared(&self, source_id: &str) -> bool {
        if self.has_entry(source_id) {
            return false;
        }
        let Some(shared) = &self.shared else {
            return false;
        };
        let Some(bytes) = shared.get(&items_key(source_id)).await else {
            return false;
        };
        let items: Vec<NewsItem> = match serde_json::from_slice(&bytes) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(source_id = %source_id, error = %e, "Discarding corrupt shared-cache entry");
                shared.del(&items_key(source_id)).await;
                return false;
            }
        };
        let count = items.len();
        {
            let entry = self.entry(source_id);
            let mut entry = entry.lock().unwrap();
            // A concurrent fetch may have landed while we were reading.
            if entry.has_data {
                return false;
            }
            entry.items = items;
            entry.has_data = true;
            entry.fetched_at_ms = self.clock.monotonic_ms();
            entry.max_size_seen = entry.max_size_seen.max(count);
        }
        tracing::info!(source_id = %source_id, count, "Restored cache entry from shared tier");
        true
    }

    /// Drop a source's entry (admin action).
    pub async fn clear(&self, source_id: &str) {
        self.entries.write().unwrap().remove(source_id);
        if let Some(shared) = &self.shared {
            shared.del(&items_key(source_id)).await;
        }
    }

    /// Monitoring snapshot for one source.
    pub fn status(&self, source_id: &str) -> Option<CacheStatus> {
        let entry = {
            let entries = self.entries.read().unwrap();
            Arc::clone(entries.get(source_id)?)
        };
        let entry = entry.lock().unwrap();
        Some(CacheStatus {
            source_id: source_id.to_string(),
            item_count: entry.items.len(),
            has_data: entry.has_data,
            age_ms: self.clock.monotonic_ms().saturating_sub(entry.fetched_at_ms),
            last_error: entry.last_error.clone(),
            protection: entry.protection,
            hit_count: entry.hit_count,
            miss_count: entry.miss_count,
            max_size_seen: entry.max_size_seen,
        })
    }
}
