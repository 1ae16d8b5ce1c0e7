//! Optional shared cache tier
//!
//! A second, cross-process tier keyed by strings with byte values and TTL.
//! It serves cold starts and dashboards; the in-memory per-source cache is
//! always the source of truth for protection decisions. Failures here are
//! logged and swallowed, never propagated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;

use crate::error::{Error, Result};
use crate::utils::Clock;

/// Key under which a source's serialized item list is stored.
pub fn items_key(canonical_id: &str) -> String {
    format!("source:{canonical_id}")
}

/// Key under which a source's aggregate stats snapshot is stored.
pub fn stats_key(canonical_id: &str) -> String {
    format!("source:{canonical_id}:stats")
}

/// Cross-process key/value store with TTL.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64);
    async fn del(&self, key: &str);
}

/// Redis-backed shared cache.
pub struct RedisSharedCache {
    pool: Pool,
}

impl RedisSharedCache {
    /// Connect and verify the server answers PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PoolConfig::from_url(url)
            .builder()
            .map_err(|e| Error::Cache(format!("failed to create pool builder: {e}")))?
            .max_size(8)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Cache(format!("failed to create Redis pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| Error::Cache(format!("failed to get Redis connection: {e}")))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::Cache(format!("failed to ping Redis: {e}")))?;

        tracing::info!(url = %url, "Connected to shared cache");
        Ok(Self { pool })
    }

    /// Connect, returning None when the shared tier is unavailable.
    pub async fn try_connect(url: &str) -> Option<Self> {
        match Self::connect(url).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "Shared cache unavailable, continuing without it");
                None
            }
        }
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Shared cache connection failed");
                return None;
            }
        };
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Shared cache read failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Shared cache connection failed");
                return;
            }
        };
        let ttl_secs = (ttl_ms / 1000).max(1);
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            tracing::warn!(key = %key, error = %e, "Shared cache write failed");
        }
    }

    async fn del(&self, key: &str) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Shared cache connection failed");
                return;
            }
        };
        if let Err(e) = conn.del::<_, ()>(key).await {
            tracing::warn!(key = %key, error = %e, "Shared cache delete failed");
        }
    }
}

/// In-memory shared cache used in tests and single-process deployments.
pub struct MemorySharedCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, (Vec<u8>, u64)>>,
}

impl MemorySharedCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.monotonic_ms();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64) {
        let expires_at = self.clock.monotonic_ms() + ttl_ms;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, expires_at));
    }

    async fn del(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    #[test]
    fn test_key_naming() {
        assert_eq!(items_key("bbc-world"), "source:bbc-world");
        assert_eq!(stats_key("bbc-world"), "source:bbc-world:stats");
    }

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemorySharedCache::new(clock.clone());

        cache.set("k", b"value".to_vec(), 1_000).await;
        assert_eq!(cache.get("k").await, Some(b"value".to_vec()));

        cache.del("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_memory_cache_ttl_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemorySharedCache::new(clock.clone());

        cache.set("k", b"value".to_vec(), 1_000).await;
        clock.advance(999);
        assert!(cache.get("k").await.is_some());

        clock.advance(2);
        assert!(cache.get("k").await.is_none());
        assert!(cache.is_empty());
    }
}
