//! Rendered-HTML reference adapter
//!
//! Extracts items from an HTML page through a CSS selector map: one list
//! selector picks the item elements, per-field selectors (with an optional
//! attribute) pick the fields inside each element. Pages that only produce
//! their content client-side can opt into headless rendering; the renderer
//! itself is opaque to the engine (`render(url, wait_for) -> html`) and is
//! drawn from a bounded pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::error::{Error, FetchError, Result};
use crate::models::{NewsItem, SourceDescriptor};

use super::SourceAdapter;

// ============================================================================
// Renderer contract
// ============================================================================

/// Opaque headless-rendering capability.
///
/// The engine only requires: render a URL (optionally waiting for a CSS
/// selector to appear) and return the resulting HTML. Process management
/// stays behind this trait.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        url: &str,
        wait_for: Option<&str>,
    ) -> std::result::Result<String, FetchError>;

    /// Recycle idle renderer processes. Called periodically by the pool.
    async fn recycle(&self) {}

    /// Release every external resource. Called once on engine shutdown.
    async fn shutdown(&self) {}
}

/// Bounded access to a renderer: at most `size` concurrent renders, periodic
/// recycling of idle processes, guaranteed release on shutdown.
pub struct RendererPool {
    renderer: Arc<dyn Renderer>,
    permits: Arc<tokio::sync::Semaphore>,
}

/// Idle renderer processes are recycled on this interval.
const RECYCLE_INTERVAL: Duration = Duration::from_secs(30 * 60);

impl RendererPool {
    pub fn new(renderer: Arc<dyn Renderer>, size: usize) -> Self {
        Self {
            renderer,
            permits: Arc::new(tokio::sync::Semaphore::new(size.max(1))),
        }
    }

    pub async fn render(
        &self,
        url: &str,
        wait_for: Option<&str>,
    ) -> std::result::Result<String, FetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Canceled)?;
        self.renderer.render(url, wait_for).await
    }

    /// Spawn the periodic idle-recycle task.
    pub fn spawn_recycler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECYCLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                pool.renderer.recycle().await;
            }
        })
    }

    pub async fn shutdown(&self) {
        self.permits.close();
        self.renderer.shutdown().await;
    }
}

// ============================================================================
// Selector map
// ============================================================================

/// One field's extraction rule.
#[derive(Debug, Clone)]
struct FieldRule {
    selector: Selector,
    /// None extracts the element text; Some(attr) extracts that attribute.
    attr: Option<String>,
}

fn parse_selector(source_id: &str, raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|e| {
        Error::Descriptor(format!(
            "web source '{source_id}': invalid selector '{raw}': {e}"
        ))
    })
}

/// Adapter for plain and rendered HTML pages.
pub struct WebSource {
    descriptor: SourceDescriptor,
    page_url: String,
    list_selector: Selector,
    fields: HashMap<String, FieldRule>,
    render: bool,
    wait_for: Option<String>,
    max_items: usize,
    renderer: Option<Arc<RendererPool>>,
}

impl WebSource {
    pub fn new(descriptor: SourceDescriptor, renderer: Option<Arc<RendererPool>>) -> Result<Self> {
        let page_url = descriptor
            .config_str("url")
            .map(str::to_string)
            .or_else(|| {
                (!descriptor.home_url.is_empty()).then(|| descriptor.home_url.clone())
            })
            .ok_or_else(|| {
                Error::Descriptor(format!(
                    "web source '{}' needs a 'url' config key",
                    descriptor.source_id
                ))
            })?;

        let list_selector = descriptor.config_str("list_selector").ok_or_else(|| {
            Error::Descriptor(format!(
                "web source '{}' needs a 'list_selector' config key",
                descriptor.source_id
            ))
        })?;
        let list_selector = parse_selector(&descriptor.source_id, list_selector)?;

        let mut fields = HashMap::new();
        if let Some(map) = descriptor.config.get("fields").and_then(Value::as_object) {
            for (name, rule) in map {
                let (selector_raw, attr) = match rule {
                    Value::String(s) => (s.as_str(), None),
                    Value::Object(obj) => (
                        obj.get("selector").and_then(Value::as_str).ok_or_else(|| {
                            Error::Descriptor(format!(
                                "web source '{}': field '{name}' needs a selector",
                                descriptor.source_id
                            ))
                        })?,
                        obj.get("attr").and_then(Value::as_str).map(str::to_string),
                    ),
                    _ => {
                        return Err(Error::Descriptor(format!(
                            "web source '{}': field '{name}' must be a selector string or object",
                            descriptor.source_id
                        )))
                    }
                };
                fields.insert(
                    name.clone(),
                    FieldRule {
                        selector: parse_selector(&descriptor.source_id, selector_raw)?,
                        attr,
                    },
                );
            }
        }
        if !fields.contains_key("title") {
            return Err(Error::Descriptor(format!(
                "web source '{}': the field map needs at least 'title'",
                descriptor.source_id
            )));
        }

        let render = descriptor.config_bool("render").unwrap_or(false);
        let wait_for = descriptor.config_str("wait_for").map(str::to_string);
        let max_items = descriptor.config_u64("max_items").unwrap_or(50) as usize;

        Ok(Self {
            page_url,
            list_selector,
            fields,
            render,
            wait_for,
            max_items,
            renderer,
            descriptor,
        })
    }

    fn extract(&self, element: &scraper::ElementRef<'_>, name: &str) -> Option<String> {
        let rule = self.fields.get(name)?;
        let target = element.select(&rule.selector).next()?;
        let value = match &rule.attr {
            Some(attr) => target.value().attr(attr)?.to_string(),
            None => target.text().collect::<String>(),
        };
        let value = value.trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    /// Run the selector map over a document. Synchronous so fixtures can
    /// drive it directly.
    fn parse_page(&self, html: &str) -> std::result::Result<Vec<NewsItem>, FetchError> {
        let document = Html::parse_document(html);
        let mut items = Vec::new();
        for element in document.select(&self.list_selector) {
            let Some(title) = self.extract(&element, "title") else {
                continue;
            };
            // The url field defaults to the item element's own href.
            let href = self
                .extract(&element, "url")
                .or_else(|| element.value().attr("href").map(str::to_string));
            let Some(href) = href else { continue };
            let Some(url) = absolutize(&self.page_url, &href) else {
                continue;
            };

            let mut item = NewsItem {
                source_id: self.descriptor.source_id.clone(),
                source_name: self.descriptor.name.clone(),
                title,
                url,
                original_id: self.extract(&element, "id").unwrap_or_default(),
                summary: self.extract(&element, "summary"),
                author: self.extract(&element, "author"),
                image_url: self
                    .extract(&element, "image_url")
                    .and_then(|u| absolutize(&self.page_url, &u)),
                language: self.descriptor.language.clone(),
                country: self.descriptor.country.clone(),
                category: self.descriptor.category.clone(),
                ..Default::default()
            };
            item.ensure_id();
            items.push(item);
            if items.len() >= self.max_items {
                break;
            }
        }
        if items.is_empty() {
            return Err(FetchError::Parse(format!(
                "no items matched the selector map on {}",
                self.page_url
            )));
        }
        Ok(items)
    }
}

#[async_trait]
impl SourceAdapter for WebSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, client: &Client) -> std::result::Result<Vec<NewsItem>, FetchError> {
        let html = if self.render {
            let Some(pool) = &self.renderer else {
                return Err(FetchError::AdapterInternal(format!(
                    "source '{}' requires rendering but no renderer is configured",
                    self.descriptor.source_id
                )));
            };
            pool.render(&self.page_url, self.wait_for.as_deref()).await?
        } else {
            let response = client.get(&self.page_url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::from_status(status));
            }
            response.text().await?
        };
        self.parse_page(&html)
    }
}

fn absolutize(base: &str, candidate: &str) -> Option<String> {
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        return Some(candidate.to_string());
    }
    url::Url::parse(base)
        .ok()?
        .join(candidate)
        .ok()
        .map(String::from)
}
