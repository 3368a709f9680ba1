//! Candidate item produced by fetch adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deal as reported by a source, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    /// Product title as shown by the source
    pub title: String,

    /// Offer price
    pub price: f64,

    /// ISO 4217 code
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Store selling the product (not the source that reported it)
    pub store: String,

    /// Product page URL
    pub url: String,

    #[serde(default)]
    pub image_url: Option<String>,

    /// When the adapter collected the item
    pub collected_at: DateTime<Utc>,
}

fn default_currency() -> String {
    "BRL".to_string()
}

impl CandidateItem {
    pub fn new(
        title: impl Into<String>,
        price: f64,
        store: impl Into<String>,
        url: impl Into<String>,
        collected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            title: title.into(),
            price,
            currency: default_currency(),
            store: store.into(),
            url: url.into(),
            image_url: None,
            collected_at,
        }
    }
}
