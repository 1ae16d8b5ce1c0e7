//! JSON API reference adapter
//!
//! Drives any JSON-over-HTTP endpoint from three pieces of configuration: a
//! request template (url, method, headers, body), a response path expression
//! selecting the item array (`$.data.items[*]` dialect: dotted segments,
//! `[*]` descends into an array), and a per-field extraction map of dotted
//! paths relative to each item.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde_json::Value;

use crate::error::{Error, FetchError, Result};
use crate::models::{NewsItem, SourceDescriptor};

use super::SourceAdapter;

/// Typed adapter configuration, parsed once at construction.
#[derive(Debug, Clone)]
struct ApiConfig {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<Value>,
    items_path: String,
    fields: HashMap<String, String>,
    max_items: usize,
}

/// Adapter for JSON APIs.
pub struct ApiSource {
    descriptor: SourceDescriptor,
    config: ApiConfig,
}

impl ApiSource {
    pub fn new(descriptor: SourceDescriptor) -> Result<Self> {
        let url = descriptor
            .config_str("url")
            .map(str::to_string)
            .or_else(|| {
                (!descriptor.home_url.is_empty()).then(|| descriptor.home_url.clone())
            })
            .ok_or_else(|| {
                Error::Descriptor(format!(
                    "api source '{}' needs a 'url' config key",
                    descriptor.source_id
                ))
            })?;

        let method = descriptor
            .config_str("method")
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                    Error::Descriptor(format!(
                        "api source '{}': invalid method '{m}'",
                        descriptor.source_id
                    ))
                })
            })
            .transpose()?
            .unwrap_or(Method::GET);

        let headers = descriptor
            .config
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let body = descriptor.config.get("body").cloned();

        let items_path = descriptor
            .config_str("items_path")
            .unwrap_or("$.items[*]")
            .to_string();

        let mut fields: HashMap<String, String> = descriptor
            .config
            .get("fields")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        fields.entry("title".into()).or_insert_with(|| "title".into());
        fields.entry("url".into()).or_insert_with(|| "url".into());

        let max_items = descriptor.config_u64("max_items").unwrap_or(100) as usize;

        Ok(Self {
            config: ApiConfig {
                url,
                method,
                headers,
                body,
                items_path,
                fields,
                max_items,
            },
            descriptor,
        })
    }

    fn field<'a>(&self, item: &'a Value, name: &str) -> Option<&'a Value> {
        let path = self.config.fields.get(name)?;
        lookup_path(item, path)
    }

    fn field_string(&self, item: &Value, name: &str) -> Option<String> {
        value_to_string(self.field(item, name)?)
    }

    /// Map one selected JSON value to an item. Returns None when the required
    /// title/url fields are missing.
    fn to_item(&self, raw: &Value) -> Option<NewsItem> {
        let title = self.field_string(raw, "title")?;
        let url = self.field_string(raw, "url")?;
        if title.is_empty() || url.is_empty() {
            return None;
        }
        let url = absolutize(&self.config.url, &url)?;

        let mut item = NewsItem {
            source_id: self.descriptor.source_id.clone(),
            source_name: self.descriptor.name.clone(),
            title,
            url,
            original_id: self.field_string(raw, "id").unwrap_or_default(),
            summary: self.field_string(raw, "summary"),
            content: self.field_string(raw, "content"),
            author: self.field_string(raw, "author"),
            image_url: self.field_string(raw, "image_url"),
            published_at: self.field(raw, "published_at").and_then(parse_timestamp),
            updated_at: self.field(raw, "updated_at").and_then(parse_timestamp),
            language: self.descriptor.language.clone(),
            country: self.descriptor.country.clone(),
            category: self.descriptor.category.clone(),
            ..Default::default()
        };
        item.ensure_id();
        Some(item)
    }

    /// Parse a response body. Split out of `fetch` so fixtures can exercise
    /// the extraction logic without a server.
    fn parse_items(&self, body: &Value) -> std::result::Result<Vec<NewsItem>, FetchError> {
        let selected = select_path(body, &self.config.items_path);
        if selected.is_empty() {
            return Err(FetchError::Parse(format!(
                "path '{}' selected nothing",
                self.config.items_path
            )));
        }
        Ok(selected
            .into_iter()
            .filter_map(|raw| self.to_item(raw))
            .take(self.config.max_items)
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for ApiSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, client: &Client) -> std::result::Result<Vec<NewsItem>, FetchError> {
        let mut request = client.request(self.config.method.clone(), &self.config.url);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &self.config.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        let body: Value = response.json().await?;
        self.parse_items(&body)
    }
}

/// Select values by the `$.a.b[*].c` dialect.
///
/// A trailing array without `[*]` is flattened, so `$.items` and
/// `$.items[*]` select the same elements.
fn select_path<'a>(root: &'a Value, path: &str) -> Vec<&'a Value> {
    let path = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    let mut current: Vec<&Value> = vec![root];
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, wildcard) = match segment.strip_suffix("[*]") {
            Some(key) => (key, true),
            None => (segment, false),
        };
        let mut next = Vec::new();
        for value in current {
            let target = if key.is_empty() {
                Some(value)
            } else {
                value.get(key)
            };
            let Some(target) = target else { continue };
            if wildcard {
                if let Some(array) = target.as_array() {
                    next.extend(array.iter());
                }
            } else {
                next.push(target);
            }
        }
        current = next;
    }
    if current.len() == 1 {
        if let Some(array) = current[0].as_array() {
            return array.iter().collect();
        }
    }
    current
}

/// Dotted-path lookup relative to one item (no wildcards).
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse RFC 3339 strings and epoch numbers (seconds or milliseconds).
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 10_000_000_000 {
                DateTime::<Utc>::from_timestamp_millis(raw)
            } else {
                DateTime::<Utc>::from_timestamp(raw, 0)
            }
        }
        _ => None,
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
