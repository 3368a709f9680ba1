// src/pipeline/adapter.rs

//! Fetch adapters and sinks.
//!
//! The engine only sees the two traits. The bundled implementations cover
//! sources that expose a JSON item feed (affiliate APIs, scraper sidecars)
//! and two ways of handing accepted items on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::error::{FetchError, SinkError};
use crate::models::{CandidateItem, SourceDescriptor};
use crate::services::TtlCache;

/// Feed payloads shared by every source pointing at the same URL.
pub type FeedCache = TtlCache<String, Arc<Vec<CandidateItem>>>;

/// Produces candidate items for one source.
///
/// Implementations must not touch scheduler state; timeouts and retries are
/// the scheduler's job.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    async fn fetch(&self, source: &SourceDescriptor) -> Result<Vec<CandidateItem>, FetchError>;
}

/// Receives accepted items. Returns how many were delivered.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, items: &[CandidateItem]) -> Result<usize, SinkError>;
}

/// One entry of a JSON feed. Looser than [`CandidateItem`]: feeds often omit
/// the currency and the collection time.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub price: f64,
    #[serde(default)]
    pub currency: Option<String>,
    pub store: String,
    pub url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
}

impl FeedItem {
    pub fn into_candidate(self, now: DateTime<Utc>) -> CandidateItem {
        let mut item = CandidateItem::new(
            self.title,
            self.price,
            self.store,
            self.url,
            self.collected_at.unwrap_or(now),
        );
        if let Some(currency) = self.currency {
            item.currency = currency;
        }
        item.image_url = self.image_url;
        item
    }
}

/// Keep items sold by `store` (case-insensitive), or all when no filter is set.
pub fn apply_store_filter(items: &[CandidateItem], store: Option<&str>) -> Vec<CandidateItem> {
    match store {
        Some(store) => items
            .iter()
            .filter(|i| i.store.eq_ignore_ascii_case(store.trim()))
            .cloned()
            .collect(),
        None => items.to_vec(),
    }
}

#[cfg(feature = "http")]
pub use http::{HttpFeedAdapter, WebhookSink};

#[cfg(feature = "http")]
mod http {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use reqwest::Client;

    use super::{FeedCache, FeedItem, FetchAdapter, Sink, apply_store_filter};
    use crate::error::{AppError, FetchError, SinkError};
    use crate::models::{CandidateItem, SourceDescriptor};

    /// Reads a JSON array of items from a URL.
    ///
    /// Loads go through the shared feed cache, so sources that share a feed
    /// (one affiliate network, several stores) cost one request per TTL.
    pub struct HttpFeedAdapter {
        client: Client,
        feed_url: String,
        store_filter: Option<String>,
        cache: Arc<FeedCache>,
    }

    impl HttpFeedAdapter {
        pub fn new(
            client: Client,
            feed_url: impl Into<String>,
            store_filter: Option<String>,
            cache: Arc<FeedCache>,
        ) -> Self {
            Self {
                client,
                feed_url: feed_url.into(),
                store_filter,
                cache,
            }
        }
    }

    #[async_trait]
    impl FetchAdapter for HttpFeedAdapter {
        async fn fetch(
            &self,
            source: &SourceDescriptor,
        ) -> Result<Vec<CandidateItem>, FetchError> {
            let client = self.client.clone();
            let url = self.feed_url.clone();
            let domain = source.domain.clone();

            let items = self
                .cache
                .get_or_load(self.feed_url.clone(), self.cache.default_ttl(), move || {
                    async move {
                        log::debug!("Loading feed {} for {}", url, domain);
                        let response = client
                            .get(&url)
                            .send()
                            .await
                            .and_then(|r| r.error_for_status())
                            .map_err(|e| AppError::fetch(&domain, e.into()))?;
                        let feed: Vec<FeedItem> = response
                            .json()
                            .await
                            .map_err(|e| AppError::fetch(&domain, FetchError::parse(e)))?;
                        let now = Utc::now();
                        let items: Vec<CandidateItem> =
                            feed.into_iter().map(|i| i.into_candidate(now)).collect();
                        Ok::<_, AppError>(Arc::new(items))
                    }
                })
                .await
                .map_err(|e| e.to_fetch_error())?;

            Ok(apply_store_filter(&items, self.store_filter.as_deref()))
        }
    }

    /// POSTs each batch as a JSON array.
    pub struct WebhookSink {
        client: Client,
        url: String,
    }

    impl WebhookSink {
        pub fn new(client: Client, url: impl Into<String>) -> Self {
            Self {
                client,
                url: url.into(),
            }
        }
    }

    #[async_trait]
    impl Sink for WebhookSink {
        async fn publish(&self, items: &[CandidateItem]) -> Result<usize, SinkError> {
            let response = self
                .client
                .post(&self.url)
                .json(items)
                .send()
                .await
                .map_err(|e| SinkError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(SinkError::Rejected(format!("{} answered {}", self.url, status)));
            }
            Ok(items.len())
        }
    }
}

/// Writes each item as one JSON line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    async fn publish(&self, items: &[CandidateItem]) -> Result<usize, SinkError> {
        let mut buf = Vec::new();
        for item in items {
            serde_json::to_writer(&mut buf, item).map_err(|e| SinkError::Rejected(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(&buf)
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(items.len())
    }
}
