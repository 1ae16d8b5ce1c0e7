//! RSS/Atom reference adapter
//!
//! Parses RSS 2.0 and Atom feeds through serde structs. Feed-level metadata
//! backfills item fields the entries leave blank (language, feed title into
//! `extra.feed_title`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, FetchError, Result};
use crate::models::{NewsItem, SourceDescriptor};

use super::SourceAdapter;

// ============================================================================
// RSS 2.0 wire structs
// ============================================================================

#[derive(Debug, Deserialize)]
struct Rss {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    title: Option<String>,
    language: Option<String>,
    #[serde(default, rename = "item")]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    author: Option<String>,
    category: Option<Vec<String>>,
    enclosure: Option<RssEnclosure>,
}

#[derive(Debug, Deserialize)]
struct RssEnclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    mime: Option<String>,
}

// ============================================================================
// Atom wire structs
// ============================================================================

#[derive(Debug, Deserialize)]
struct AtomFeed {
    title: Option<String>,
    #[serde(default, rename = "entry")]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<String>,
    id: Option<String>,
    #[serde(default, rename = "link")]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<String>,
    content: Option<String>,
    author: Option<AtomAuthor>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    name: Option<String>,
}

/// Adapter for RSS and Atom feeds.
pub struct RssSource {
    descriptor: SourceDescriptor,
    feed_url: String,
    max_items: usize,
}

impl RssSource {
    pub fn new(descriptor: SourceDescriptor) -> Result<Self> {
        let feed_url = descriptor
            .config_str("feed_url")
            .map(str::to_string)
            .or_else(|| {
                (!descriptor.home_url.is_empty()).then(|| descriptor.home_url.clone())
            })
            .ok_or_else(|| {
                Error::Descriptor(format!(
                    "rss source '{}' needs a 'feed_url' config key",
                    descriptor.source_id
                ))
            })?;
        let max_items = descriptor.config_u64("max_items").unwrap_or(20) as usize;
        Ok(Self {
            descriptor,
            feed_url,
            max_items,
        })
    }

    /// Parse a feed document: RSS 2.0 first, Atom as the fallback.
    fn parse_feed(&self, body: &str) -> std::result::Result<Vec<NewsItem>, FetchError> {
        if let Ok(rss) = from_str::<Rss>(body) {
            return Ok(self.from_rss(rss));
        }
        let feed: AtomFeed = from_str(body)
            .map_err(|e| FetchError::Parse(format!("neither RSS nor Atom: {e}")))?;
        Ok(self.from_atom(feed))
    }

    fn from_rss(&self, rss: Rss) -> Vec<NewsItem> {
        let channel = rss.channel;
        let feed_title = channel.title.clone();
        let feed_language = channel.language.clone();
        channel
            .items
            .into_iter()
            .filter_map(|entry| {
                let title = non_empty(entry.title)?;
                let url = non_empty(entry.link)?;
                let mut item = NewsItem {
                    source_id: self.descriptor.source_id.clone(),
                    source_name: self.descriptor.name.clone(),
                    title,
                    url,
                    original_id: entry.guid.unwrap_or_default(),
                    summary: entry.description,
                    author: entry.author,
                    image_url: entry
                        .enclosure
                        .filter(|e| {
                            e.mime
                                .as_deref()
                                .map(|m| m.starts_with("image/"))
                                .unwrap_or(true)
                        })
                        .and_then(|e| e.url),
                    published_at: entry.pub_date.as_deref().and_then(parse_feed_date),
                    language: self
                        .descriptor
                        .language
                        .clone()
                        .or_else(|| feed_language.clone()),
                    country: self.descriptor.country.clone(),
                    category: self
                        .descriptor
                        .category
                        .clone()
                        .or_else(|| entry.category.as_ref().and_then(|c| c.first().cloned())),
                    ..Default::default()
                };
                if let Some(feed_title) = &feed_title {
                    item.extra
                        .insert("feed_title".into(), Value::from(feed_title.clone()));
                }
                item.ensure_id();
                Some(item)
            })
            .take(self.max_items)
            .collect()
    }

    fn from_atom(&self, feed: AtomFeed) -> Vec<NewsItem> {
        let feed_title = feed.title.clone();
        feed.entries
            .into_iter()
            .filter_map(|entry| {
                let title = non_empty(entry.title)?;
                // Prefer the alternate link; fall back to the first href.
                let url = entry
                    .links
                    .iter()
                    .find(|l| l.rel.as_deref() == Some("alternate"))
                    .and_then(|l| l.href.clone())
                    .or_else(|| entry.links.iter().find_map(|l| l.href.clone()))?;
                let mut item = NewsItem {
                    source_id: self.descriptor.source_id.clone(),
                    source_name: self.descriptor.name.clone(),
                    title,
                    url,
                    original_id: entry.id.unwrap_or_default(),
                    summary: entry.summary,
                    content: entry.content,
                    author: entry.author.and_then(|a| a.name),
                    published_at: entry
                        .published
                        .as_deref()
                        .or(entry.updated.as_deref())
                        .and_then(parse_feed_date),
                    updated_at: entry.updated.as_deref().and_then(parse_feed_date),
                    language: self.descriptor.language.clone(),
                    country: self.descriptor.country.clone(),
                    category: self.descriptor.category.clone(),
                    ..Default::default()
                };
                if let Some(feed_title) = &feed_title {
                    item.extra
                        .insert("feed_title".into(), Value::from(feed_title.clone()));
                }
                item.ensure_id();
                Some(item)
            })
            .take(self.max_items)
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for RssSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, client: &Client) -> std::result::Result<Vec<NewsItem>, FetchError> {
        tracing::debug!(source_id = %self.descriptor.source_id, url = %self.feed_url, "Fetching feed");
        let response = client.get(&self.feed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }
        let body = response.text().await?;
        self.parse_feed(&body)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Feeds in the wild carry RFC 2822 dates (RSS) or RFC 3339 (Atom); accept
/// either.
fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;

    const RSS_FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <language>en-gb</language>
    <item>
      <title>First story</title>
      <link>https://example.com/first</link>
      <guid>first-guid</guid>
      <pubDate>Mon, 01 Sep 2025 12:34:56 GMT</pubDate>
      <description>Summary of the first story</description>
      <enclosure url="https://example.com/first.jpg" type="image/jpeg"/>
    </item>
    <item>
      <title>Second story</title>
      <link>https://example.com/second</link>
    </item>
    <item>
      <title></title>
      <link>https://example.com/missing-title</link>
    </item>
  </channel>
</rss>"#;

    const ATOM_FIXTURE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <entry>
    <title>Atom entry</title>
    <id>urn:uuid:1</id>
    <link rel="alternate" href="https://example.com/atom/1"/>
    <link rel="edit" href="https://example.com/edit/1"/>
    <published>2025-09-01T10:00:00Z</published>
    <updated>2025-09-01T11:00:00Z</updated>
    <summary>An atom summary</summary>
    <author><name>Ada</name></author>
  </entry>
</feed>"#;

    fn source() -> RssSource {
        let mut desc = SourceDescriptor::new("demo-feed", "Demo Feed", SourceType::Rss);
        desc.config.insert(
            "feed_url".into(),
            Value::from("https://example.com/feed.xml"),
        );
        RssSource::new(desc).unwrap()
    }

    #[test]
    fn test_parse_rss() {
        let items = source().parse_feed(RSS_FIXTURE).unwrap();
        // The empty-title item is dropped.
        assert_eq!(items.len(), 2);

        let first = &items[0];
        assert_eq!(first.title, "First story");
        assert_eq!(first.original_id, "first-guid");
        assert_eq!(first.summary.as_deref(), Some("Summary of the first story"));
        assert_eq!(first.image_url.as_deref(), Some("https://example.com/first.jpg"));
        assert!(first.published_at.is_some());
        assert_eq!(first.language.as_deref(), Some("en-gb"));
        assert_eq!(first.extra.get("feed_title").unwrap(), "Example Feed");
        assert_eq!(first.source_id, "demo-feed");
        assert!(!first.id.is_empty());
    }

    #[test]
    fn test_parse_atom() {
        let items = source().parse_feed(ATOM_FIXTURE).unwrap();
        assert_eq!(items.len(), 1);

        let entry = &items[0];
        assert_eq!(entry.title, "Atom entry");
        // The alternate link wins over the edit link.
        assert_eq!(entry.url, "https://example.com/atom/1");
        assert_eq!(entry.author.as_deref(), Some("Ada"));
        assert!(entry.published_at.is_some());
        assert!(entry.updated_at.is_some());
        assert_eq!(entry.original_id, "urn:uuid:1");
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        let err = source().parse_feed("not xml at all").unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn test_max_items_cap() {
        let mut desc = SourceDescriptor::new("demo-feed", "Demo Feed", SourceType::Rss);
        desc.config.insert(
            "feed_url".into(),
            Value::from("https://example.com/feed.xml"),
        );
        desc.config.insert("max_items".into(), Value::from(1));
        let source = RssSource::new(desc).unwrap();
        assert_eq!(source.parse_feed(RSS_FIXTURE).unwrap().len(), 1);
    }

    #[test]
    fn test_feed_date_parsing() {
        assert!(parse_feed_date("Mon, 01 Sep 2025 12:34:56 GMT").is_some());
        assert!(parse_feed_date("2025-09-01T10:00:00Z").is_some());
        assert!(parse_feed_date("yesterday").is_none());
    }

    #[test]
    fn test_feed_url_falls_back_to_home_url() {
        let mut desc = SourceDescriptor::new("demo-feed", "Demo Feed", SourceType::Rss);
        desc.home_url = "https://example.com/rss".to_string();
        let source = RssSource::new(desc).unwrap();
        assert_eq!(source.feed_url, "https://example.com/rss");
    }
}
