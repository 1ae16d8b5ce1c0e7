// Core data structures for the heatlink fetch engine

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::error::{Error, ErrorKind, Result};

/// Maximum length of a stored error message, in bytes.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 512;

/// A single trending item emitted by a source adapter.
///
/// `source_id` and `source_name` are always top-level fields; the engine
/// strips both keys out of `extra` on ingest so downstream consumers never
/// have to look in two places.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NewsItem {
    /// Stable identifier, derived by the engine when the adapter leaves it empty.
    #[serde(default)]
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub title: String,
    /// Absolute URL of the item.
    pub url: String,
    /// Adapter-defined local id (feed guid, API item id, ...).
    #[serde(default)]
    pub original_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    /// Adapter-specific payload. Never contains `source_id` or `source_name`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NewsItem {
    /// Derive the stable item id from the identity tuple.
    ///
    /// Two items with equal `(source_id, url, published_at, title)` always
    /// produce the same id, across runs and processes.
    pub fn derive_id(
        source_id: &str,
        url: &str,
        published_at: Option<DateTime<Utc>>,
        title: &str,
    ) -> String {
        let mut hasher = Sha1::new();
        hasher.update(source_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        if let Some(ts) = published_at {
            hasher.update(ts.to_rfc3339().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(title.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Fill in the derived id if the adapter did not supply one.
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Self::derive_id(&self.source_id, &self.url, self.published_at, &self.title);
        }
    }
}

/// Source type, deciding which reference adapter the factory instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Api,
    Web,
    Rss,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Web => "web",
            Self::Rss => "rss",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a source relates to the proxy pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyMode {
    /// Never route through a proxy, even for listed domains.
    Never,
    /// Defer to the pool's proxy-required domain list.
    #[default]
    IfRequired,
    /// Always route through a proxy.
    Always,
}

/// Per-source proxy policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxyPolicy {
    #[serde(default)]
    pub mode: ProxyMode,
    /// Named subset of the pool this source may draw from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_group: Option<String>,
    /// Permit a direct connection when no usable proxy exists.
    #[serde(default)]
    pub allow_fallback_direct: bool,
}

/// Static per-source configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Unique id, lowercase ASCII, hyphen-canonical.
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub home_url: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Larger means the scheduler dispatches this source sooner.
    #[serde(default)]
    pub priority: i32,
    /// Adapter-specific configuration, parsed by the adapter at construction.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Zero means "use the engine default".
    #[serde(default)]
    pub update_interval_ms: u64,
    /// Zero means "use the engine default".
    #[serde(default)]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_true")]
    pub adaptive_enabled: bool,
    #[serde(default)]
    pub proxy_policy: ProxyPolicy,
}

fn default_true() -> bool {
    true
}

impl SourceDescriptor {
    /// Minimal descriptor with defaults suitable for tests and bootstrap files.
    pub fn new(
        source_id: impl Into<String>,
        name: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            home_url: String::new(),
            source_type,
            category: None,
            country: None,
            language: None,
            priority: 0,
            config: Map::new(),
            update_interval_ms: 600_000,
            cache_ttl_ms: 300_000,
            adaptive_enabled: true,
            proxy_policy: ProxyPolicy::default(),
        }
    }

    /// Hyphen-canonical form of `source_id`.
    pub fn canonical_id(&self) -> String {
        canonical_source_id(&self.source_id)
    }

    /// Validate the descriptor's interval constraints.
    pub fn validate(&self) -> Result<()> {
        if self.source_id.is_empty() {
            return Err(Error::Descriptor("source_id must not be empty".into()));
        }
        if !self
            .source_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        {
            return Err(Error::Descriptor(format!(
                "source_id '{}' must be lowercase ASCII",
                self.source_id
            )));
        }
        if self.name.is_empty() {
            return Err(Error::Descriptor(format!(
                "source '{}' has an empty name",
                self.source_id
            )));
        }
        if self.update_interval_ms < 60_000 {
            return Err(Error::Descriptor(format!(
                "source '{}': update_interval_ms must be >= 60000",
                self.source_id
            )));
        }
        if self.cache_ttl_ms < 30_000 {
            return Err(Error::Descriptor(format!(
                "source '{}': cache_ttl_ms must be >= 30000",
                self.source_id
            )));
        }
        if self.cache_ttl_ms > self.update_interval_ms * 2 {
            return Err(Error::Descriptor(format!(
                "source '{}': cache_ttl_ms must be <= 2x update_interval_ms",
                self.source_id
            )));
        }
        Ok(())
    }

    /// Ratio below which a successful fetch is considered a suspicious shrink.
    pub fn shrink_threshold(&self) -> f64 {
        self.config
            .get("shrink_threshold")
            .and_then(Value::as_f64)
            .filter(|v| *v > 0.0 && *v < 1.0)
            .unwrap_or(0.30)
    }

    /// Per-fetch deadline override, falling back to the engine default.
    pub fn fetch_deadline_ms(&self, default_ms: u64) -> u64 {
        self.config
            .get("fetch_deadline_ms")
            .and_then(Value::as_u64)
            .unwrap_or(default_ms)
    }

    /// String-valued config key helper.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Unsigned-integer config key helper.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }

    /// Boolean config key helper.
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }
}

/// Rewrite a raw source id into its canonical hyphen form.
///
/// Canonicalization applies on registration, on lookup, and on every recorded
/// outcome, so underscore synonyms always land on the same entry.
pub fn canonical_source_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('_', "-")
}

/// Who initiated an outbound fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Initiated by the background scheduler.
    Internal,
    /// Initiated in response to a caller.
    External,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single fetch attempt, recorded into the stats collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsOutcome {
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub item_count: usize,
    /// Whether the committed items came from the cache (protection applied).
    pub cache_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub call_type: CallType,
}

impl StatsOutcome {
    /// Truncate an error message to the storage limit, on a char boundary.
    pub fn truncate_message(msg: &str) -> String {
        if msg.len() <= MAX_ERROR_MESSAGE_BYTES {
            return msg.to_string();
        }
        let mut end = MAX_ERROR_MESSAGE_BYTES;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg[..end].to_string()
    }
}
