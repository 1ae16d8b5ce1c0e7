//! Engine configuration
//!
//! Environment-like inputs the engine reads once at startup. Everything else
//! is per-source via [`SourceDescriptor`](crate::models::SourceDescriptor).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default desktop user-agent used when neither the environment nor the
/// source descriptor supplies one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default update interval for sources that do not specify one.
    pub default_update_interval_ms: u64,

    /// Default cache TTL for sources that do not specify one.
    pub default_cache_ttl_ms: u64,

    /// Default per-fetch deadline.
    pub fetch_deadline_ms: u64,

    /// Global bound on concurrent fetches.
    pub max_concurrent_fetches: usize,

    /// Optional shared-cache (Redis) address. None disables the second tier.
    pub shared_cache_url: Option<String>,

    /// Domain labels that require a proxy (suffix match).
    pub proxy_required_domains: Vec<String>,

    /// Default user-agent string.
    pub user_agent: String,

    /// Headless renderer pool size.
    pub renderer_pool_size: usize,

    /// Per-source item cap enforced on ingest.
    pub max_items_per_source: usize,

    /// Connect timeout for outbound requests.
    pub connect_timeout_ms: u64,

    /// Read timeout for outbound requests.
    pub read_timeout_ms: u64,

    /// Stats flush interval.
    pub stats_flush_secs: u64,

    /// How long shutdown waits for in-flight fetches to drain.
    pub shutdown_grace_ms: u64,

    /// Bounded window the engine waits for the downstream emitter.
    pub emit_deadline_ms: u64,

    /// Interval between proxy health sweeps.
    pub proxy_sweep_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_update_interval_ms: 600_000,
            default_cache_ttl_ms: 300_000,
            fetch_deadline_ms: 60_000,
            max_concurrent_fetches: 8,
            shared_cache_url: None,
            proxy_required_domains: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            renderer_pool_size: 2,
            max_items_per_source: 500,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            stats_flush_secs: 300,
            shutdown_grace_ms: 30_000,
            emit_deadline_ms: 5_000,
            proxy_sweep_secs: 60,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let proxy_required_domains = std::env::var("HEATLINK_PROXY_DOMAINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            default_update_interval_ms: env_parse(
                "HEATLINK_UPDATE_INTERVAL_MS",
                defaults.default_update_interval_ms,
            ),
            default_cache_ttl_ms: env_parse("HEATLINK_CACHE_TTL_MS", defaults.default_cache_ttl_ms),
            fetch_deadline_ms: env_parse("HEATLINK_FETCH_DEADLINE_MS", defaults.fetch_deadline_ms),
            max_concurrent_fetches: env_parse(
                "HEATLINK_MAX_CONCURRENT",
                defaults.max_concurrent_fetches,
            ),
            shared_cache_url: std::env::var("HEATLINK_REDIS_URL").ok().filter(|v| !v.is_empty()),
            proxy_required_domains,
            user_agent: std::env::var("HEATLINK_USER_AGENT")
                .unwrap_or_else(|_| defaults.user_agent.clone()),
            renderer_pool_size: env_parse("HEATLINK_RENDERER_POOL", defaults.renderer_pool_size),
            max_items_per_source: env_parse("HEATLINK_MAX_ITEMS", defaults.max_items_per_source),
            connect_timeout_ms: env_parse(
                "HEATLINK_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
            ),
            read_timeout_ms: env_parse("HEATLINK_READ_TIMEOUT_MS", defaults.read_timeout_ms),
            stats_flush_secs: env_parse("HEATLINK_STATS_FLUSH_SECS", defaults.stats_flush_secs),
            shutdown_grace_ms: env_parse("HEATLINK_SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms),
            emit_deadline_ms: env_parse("HEATLINK_EMIT_DEADLINE_MS", defaults.emit_deadline_ms),
            proxy_sweep_secs: env_parse("HEATLINK_PROXY_SWEEP_SECS", defaults.proxy_sweep_secs),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches == 0 {
            anyhow::bail!("max_concurrent_fetches must be greater than 0");
        }
        if self.default_update_interval_ms < 60_000 {
            anyhow::bail!("default_update_interval_ms must be >= 60000");
        }
        if self.default_cache_ttl_ms < 30_000 {
            anyhow::bail!("default_cache_ttl_ms must be >= 30000");
        }
        if self.fetch_deadline_ms == 0 {
            anyhow::bail!("fetch_deadline_ms must be greater than 0");
        }
        if self.max_items_per_source == 0 {
            anyhow::bail!("max_items_per_source must be greater than 0");
        }
        Ok(())
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_millis(self.fetch_deadline_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn emit_deadline(&self) -> Duration {
        Duration::from_millis(self.emit_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_fetches, 8);
        assert_eq!(config.renderer_pool_size, 2);
        assert_eq!(config.max_items_per_source, 500);
    }

    #[test]
    fn test_invalid_concurrency() {
        let mut config = EngineConfig::default();
        config.max_concurrent_fetches = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_floor() {
        let mut config = EngineConfig::default();
        config.default_update_interval_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let config = EngineConfig::default();
        assert_eq!(config.fetch_deadline(), Duration::from_secs(60));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.emit_deadline(), Duration::from_secs(5));
    }
}
