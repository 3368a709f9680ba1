//! Source descriptor and category.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::duration;

/// Kind of site a source is. Drives the base scheduling weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    /// Buscapé, Zoom
    PriceComparison,
    /// Promobit, Pelando
    DealAggregator,
    /// MercadoLivre, Shopee
    Marketplace,
    /// Amazon, AliExpress
    Ecommerce,
    /// MeuPC.net
    HardwareSpecialist,
}

impl SourceCategory {
    /// Base scheduling weight. Deal aggregators churn fastest.
    pub fn weight(self) -> f64 {
        match self {
            SourceCategory::DealAggregator => 1.5,
            SourceCategory::PriceComparison => 1.2,
            SourceCategory::HardwareSpecialist => 1.1,
            SourceCategory::Ecommerce => 1.0,
            SourceCategory::Marketplace => 0.9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceCategory::PriceComparison => "price_comparison",
            SourceCategory::DealAggregator => "deal_aggregator",
            SourceCategory::Marketplace => "marketplace",
            SourceCategory::Ecommerce => "ecommerce",
            SourceCategory::HardwareSpecialist => "hardware_specialist",
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SourceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "price_comparison" => Ok(Self::PriceComparison),
            "deal_aggregator" => Ok(Self::DealAggregator),
            "marketplace" => Ok(Self::Marketplace),
            "ecommerce" | "e_commerce" => Ok(Self::Ecommerce),
            "hardware_specialist" => Ok(Self::HardwareSpecialist),
            other => Err(format!("unknown source category '{other}'")),
        }
    }
}

/// Scheduling metadata for one source.
///
/// Owned by the registry. `last_poll` only ever moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Normalized domain, the source's identity
    pub domain: String,

    /// Display name
    pub name: String,

    pub category: SourceCategory,

    /// Operator-set multiplier on top of the category weight
    #[serde(default = "default_priority")]
    pub priority: f64,

    /// Minimum time between two polls
    #[serde(with = "duration::secs")]
    pub min_poll_interval: Duration,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Last time the source was processed; `None` if never
    #[serde(default)]
    pub last_poll: Option<DateTime<Utc>>,

    /// Items accepted after deduplication, over the source's lifetime
    #[serde(default)]
    pub items_found: u64,

    #[serde(default)]
    pub attempts: u64,

    #[serde(default)]
    pub successes: u64,

    #[serde(default)]
    pub failures: u64,

    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_priority() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl SourceDescriptor {
    /// Create an enabled, never-polled source.
    pub fn new(
        domain: impl Into<String>,
        name: impl Into<String>,
        category: SourceCategory,
        min_poll_interval: Duration,
    ) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            category,
            priority: default_priority(),
            min_poll_interval,
            enabled: true,
            last_poll: None,
            items_found: 0,
            attempts: 0,
            successes: 0,
            failures: 0,
            last_success: None,
            last_error: None,
        }
    }

    /// Builder-style priority override.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Earliest instant the source may be polled again.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.last_poll.map(|t| t + self.min_poll_interval)
    }

    /// Enabled and its polling cadence has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_poll {
            None => true,
            Some(last) => now - last >= self.min_poll_interval,
        }
    }

    /// How long past its due time the source is (zero if not due).
    pub fn overrun(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_due_at()
            .map(|due| if now > due { now - due } else { Duration::zero() })
    }
}
