//! Source adapters: contract, registry and factory
//!
//! Every external source satisfies [`SourceAdapter`]: a descriptor, an async
//! `fetch` against an engine-provided HTTP client, and an optional `close`
//! for adapters holding external handles. The registry maps canonical source
//! ids to adapter instances; the factory instantiates the adapter matching a
//! descriptor's `type` and always hands back an instance carrying the
//! canonical id, whatever synonym the caller used.

pub mod api;
pub mod rss;
pub mod web;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{Error, FetchError, Result};
use crate::models::{canonical_source_id, NewsItem, SourceDescriptor, SourceType};

pub use api::ApiSource;
pub use rss::RssSource;
pub use web::{Renderer, RendererPool, WebSource};

/// The pluggable adapter contract.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Static configuration of this source.
    fn descriptor(&self) -> &SourceDescriptor;

    /// Fetch the current item list. The client is provided by the engine;
    /// adapters must not open their own sockets.
    async fn fetch(&self, client: &Client) -> std::result::Result<Vec<NewsItem>, FetchError>;

    /// Release external handles (headless browsers, ...). Default: nothing.
    async fn close(&self) {}
}

/// Read-mostly registry of adapters keyed by canonical source id.
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve any synonym to the id used for all stored state.
    ///
    /// Applies the hyphen rewrite first, then the legacy alias table (alias
    /// targets are themselves canonical).
    pub fn canonicalize(&self, raw: &str) -> String {
        let canonical = canonical_source_id(raw);
        self.aliases
            .read()
            .unwrap()
            .get(&canonical)
            .cloned()
            .unwrap_or(canonical)
    }

    /// Register an adapter under its canonical id.
    ///
    /// Two descriptors whose canonical forms collide are rejected; an
    /// underscore synonym of an already-registered id is the same entry, so
    /// re-registering it is also an error.
    pub fn register(&self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        let descriptor = adapter.descriptor();
        descriptor.validate()?;
        let canonical = self.canonicalize(&descriptor.source_id);
        let mut sources = self.sources.write().unwrap();
        if sources.contains_key(&canonical) {
            return Err(Error::registry(format!(
                "duplicate canonical source id '{canonical}'"
            )));
        }
        tracing::info!(source_id = %canonical, source_type = %descriptor.source_type, "Registered source");
        sources.insert(canonical, adapter);
        Ok(())
    }

    /// Swap an adapter in place (config update path). Unlike `register`,
    /// an existing entry under the same canonical id is expected.
    pub fn replace(&self, adapter: Arc<dyn SourceAdapter>) {
        let canonical = self.canonicalize(&adapter.descriptor().source_id);
        self.sources.write().unwrap().insert(canonical, adapter);
    }

    /// Map a legacy alias onto a canonical id.
    pub fn register_alias(&self, alias: &str, canonical: &str) {
        self.aliases.write().unwrap().insert(
            canonical_source_id(alias),
            canonical_source_id(canonical),
        );
    }

    /// Remove an adapter, returning it so the caller can `close()` it.
    pub fn deregister(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        let canonical = self.canonicalize(source_id);
        let removed = self.sources.write().unwrap().remove(&canonical);
        if removed.is_some() {
            tracing::info!(source_id = %canonical, "Deregistered source");
        }
        removed
    }

    /// Look up an adapter by any synonym of its id.
    pub fn resolve(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        let canonical = self.canonicalize(source_id);
        self.sources.read().unwrap().get(&canonical).cloned()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        let canonical = self.canonicalize(source_id);
        self.sources.read().unwrap().contains_key(&canonical)
    }

    /// Descriptors of every registered source.
    pub fn list(&self) -> Vec<SourceDescriptor> {
        let mut descriptors: Vec<SourceDescriptor> = self
            .sources
            .read()
            .unwrap()
            .values()
            .map(|a| a.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        descriptors
    }

    /// Canonical ids of every registered source.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every adapter (shutdown path).
    pub async fn close_all(&self) {
        let adapters: Vec<Arc<dyn SourceAdapter>> =
            self.sources.read().unwrap().values().cloned().collect();
        for adapter in adapters {
            adapter.close().await;
        }
    }
}

/// Instantiate the adapter matching the descriptor's `type`.
///
/// The descriptor's id is rewritten to canonical form before construction;
/// the returned instance always carries the canonical id.
pub fn build_adapter(
    mut descriptor: SourceDescriptor,
    renderer: Option<Arc<RendererPool>>,
) -> Result<Arc<dyn SourceAdapter>> {
    descriptor.source_id = canonical_source_id(&descriptor.source_id);
    descriptor.validate()?;
    let adapter: Arc<dyn SourceAdapter> = match descriptor.source_type {
        SourceType::Api => Arc::new(ApiSource::new(descriptor)?),
        SourceType::Rss => Arc::new(RssSource::new(descriptor)?),
        SourceType::Web => Arc::new(WebSource::new(descriptor, renderer)?),
    };
    Ok(adapter)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted adapter used across engine and scheduler tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type FetchScript =
        dyn Fn(usize) -> std::result::Result<Vec<NewsItem>, FetchError> + Send + Sync;

    /// Adapter whose fetch behavior is driven by a closure of the call index.
    pub struct ScriptedSource {
        descriptor: SourceDescriptor,
        calls: AtomicUsize,
        delay: Duration,
        script: Box<FetchScript>,
    }

    impl ScriptedSource {
        pub fn new<F>(descriptor: SourceDescriptor, script: F) -> Self
        where
            F: Fn(usize) -> std::result::Result<Vec<NewsItem>, FetchError>
                + Send
                + Sync
                + 'static,
        {
            Self {
                descriptor,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                script: Box::new(script),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn fetch_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        fn descriptor(&self) -> &SourceDescriptor {
            &self.descriptor
        }

        async fn fetch(
            &self,
            _client: &Client,
        ) -> std::result::Result<Vec<NewsItem>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(call)
        }
    }

    pub fn plain_items(source_id: &str, titles: &[&str]) -> Vec<NewsItem> {
        titles
            .iter()
            .map(|t| NewsItem {
                source_id: source_id.to_string(),
                source_name: "Scripted".to_string(),
                title: t.to_string(),
                url: format!("https://example.com/{t}"),
                ..Default::default()
            })
            .collect()
    }
}
