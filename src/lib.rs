//! heatlink - Source Fetch Engine for trending-news aggregation
//!
//! A registry of pluggable source adapters (JSON APIs, RSS/Atom feeds, plain
//! and rendered HTML pages), driven on adaptive per-source schedules, behind
//! a request-coalescing two-tier cache with protection against bad fetches,
//! with outbound traffic routed through an ordered proxy pool and every
//! fetch outcome recorded into per-source statistics.
//!
//! # Architecture
//!
//! - [`models`] - Item and descriptor data model, canonical ids
//! - [`config`] - Engine configuration from the environment
//! - [`cache`] - Per-source cache with protection, optional shared tier
//! - [`proxy`] - Proxy pool with health tracking and failover
//! - [`client`] - Per-source HTTP client factory
//! - [`source`] - Adapter contract, registry, factory, reference adapters
//! - [`stats`] - Per-source outcome statistics and the stats sink
//! - [`scheduler`] - Adaptive per-source deadlines
//! - [`engine`] - The fetch engine orchestrating all of the above
//! - [`emit`] - Downstream emission boundary
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use heatlink::config::EngineConfig;
//! use heatlink::emit::LogEmitter;
//! use heatlink::engine::{FetchEngine, GetNewsOptions};
//! use heatlink::models::{SourceDescriptor, SourceType};
//! use heatlink::stats::NullStatsSink;
//! use heatlink::utils::SystemClock;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = FetchEngine::new(
//!         EngineConfig::from_env()?,
//!         Arc::new(SystemClock::new()),
//!         Arc::new(NullStatsSink),
//!         Arc::new(LogEmitter),
//!         None,
//!         None,
//!     );
//!
//!     let mut descriptor =
//!         SourceDescriptor::new("hn-front", "Hacker News", SourceType::Api);
//!     descriptor.config.insert(
//!         "url".into(),
//!         "https://hn.algolia.com/api/v1/search?tags=front_page".into(),
//!     );
//!     descriptor.config.insert("items_path".into(), "$.hits[*]".into());
//!     engine.register_descriptor(descriptor)?;
//!
//!     let (items, meta) = engine.get_news("hn-front", GetNewsOptions::default()).await?;
//!     println!("{} items (cache hit: {})", items.len(), meta.cache_hit);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod emit;
pub mod engine;
pub mod error;
pub mod models;
pub mod proxy;
pub mod scheduler;
pub mod source;
pub mod stats;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::emit::{Emitter, LogEmitter, NullEmitter};
    pub use crate::engine::{FetchEngine, FetchMeta, GetNewsOptions};
    pub use crate::error::{Error, ErrorKind, FetchError, Result};
    pub use crate::models::{CallType, NewsItem, SourceDescriptor, SourceType, StatsOutcome};
    pub use crate::source::{SourceAdapter, SourceRegistry};
    pub use crate::stats::{NullStatsSink, StatsSink};
    pub use crate::utils::{Clock, SystemClock};
}

// Direct re-exports for convenience
pub use engine::{FetchEngine, GetNewsOptions};
pub use error::{Error, ErrorKind, FetchError, Result};
pub use models::{CallType, NewsItem, SourceDescriptor, StatsOutcome};
