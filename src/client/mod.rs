//! Per-source HTTP client factory
//!
//! Adapters never open their own sockets: for each (source, attempt) the
//! factory builds a configured `reqwest::Client` carrying the proxy decision
//! from the pool, the source's timeouts, a redirect cap and the user-agent.
//! The per-fetch deadline is enforced by the engine around the adapter call,
//! not baked into the client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::Client;

use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::models::SourceDescriptor;
use crate::proxy::{ProxyPool, ProxySelection};

/// Redirects followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// A built client plus the proxy it routes through, so fetch outcomes can be
/// reported back to the pool.
#[derive(Debug)]
pub struct PreparedClient {
    pub client: Client,
    pub proxy: ProxySelection,
}

impl PreparedClient {
    pub fn proxy_id(&self) -> Option<&str> {
        self.proxy.proxy_id()
    }
}

/// Builds per-source clients honoring proxy policy, UA, timeouts and
/// redirect rules.
pub struct ClientFactory {
    config: Arc<EngineConfig>,
    pool: Arc<ProxyPool>,
}

impl ClientFactory {
    pub fn new(config: Arc<EngineConfig>, pool: Arc<ProxyPool>) -> Self {
        Self { config, pool }
    }

    /// Build a client for one fetch attempt.
    ///
    /// `exclude_proxy` names an endpoint that just failed, for the single
    /// failover retry: selection skips it and picks the next in order.
    pub fn build(
        &self,
        descriptor: &SourceDescriptor,
        exclude_proxy: Option<&str>,
    ) -> Result<PreparedClient, FetchError> {
        let selection = self.select_proxy(descriptor, exclude_proxy)?;

        let connect_timeout = descriptor
            .config_u64("connect_timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout());
        let read_timeout = descriptor
            .config_u64("read_timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.read_timeout());
        let user_agent = descriptor
            .config_str("user_agent")
            .unwrap_or(&self.config.user_agent);

        let mut builder = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(user_agent)
            .gzip(true)
            .cookie_store(true);

        // TLS verification stays on unless the descriptor explicitly opts out.
        if descriptor.config_bool("insecure_tls") == Some(true) {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let ProxySelection::Via(endpoint) = &selection {
            let proxy = reqwest::Proxy::all(endpoint.spec().url())
                .map_err(|e| FetchError::Network(format!("invalid proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(PreparedClient {
            client,
            proxy: selection,
        })
    }

    fn select_proxy(
        &self,
        descriptor: &SourceDescriptor,
        exclude: Option<&str>,
    ) -> Result<ProxySelection, FetchError> {
        let policy = &descriptor.proxy_policy;
        let target = if descriptor.home_url.is_empty() {
            descriptor.config_str("url").unwrap_or("")
        } else {
            descriptor.home_url.as_str()
        };

        if !self.pool.requires_proxy(target, policy) {
            return Ok(ProxySelection::Direct);
        }

        let group = policy.proxy_group.as_deref();
        let selected = match exclude {
            Some(failed) => self.pool.select_after(group, failed),
            None => self.pool.select(group),
        };

        match selected {
            Some(endpoint) => {
                tracing::debug!(
                    source_id = %descriptor.source_id,
                    proxy_id = %endpoint.id(),
                    "Routing fetch through proxy"
                );
                Ok(ProxySelection::Via(endpoint))
            }
            None if policy.allow_fallback_direct => {
                tracing::debug!(
                    source_id = %descriptor.source_id,
                    "No usable proxy, falling back to direct connection"
                );
                Ok(ProxySelection::Direct)
            }
            None => Err(FetchError::ProxyUnavailable),
        }
    }
}
