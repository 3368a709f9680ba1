//! Bounded history of scrape outcomes with per-domain totals.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::ScrapeOutcome;

/// Running totals for one domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub items_found: u64,
    pub items_accepted: u64,
    pub items_published: u64,
    pub total_duration_ms: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DomainStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn mean_duration(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::zero();
        }
        Duration::milliseconds(self.total_duration_ms / self.attempts as i64)
    }
}

pub struct OutcomeLog {
    capacity: usize,
    recent: Mutex<VecDeque<ScrapeOutcome>>,
    totals: Mutex<BTreeMap<String, DomainStats>>,
}

impl OutcomeLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            totals: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, outcome: ScrapeOutcome) {
        {
            let mut totals = self.totals.lock();
            let stats = totals.entry(outcome.domain.clone()).or_default();
            stats.attempts += 1;
            if outcome.success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            stats.items_found += outcome.items_found as u64;
            stats.items_accepted += outcome.items_accepted as u64;
            stats.items_published += outcome.items_published as u64;
            stats.total_duration_ms += outcome.duration.num_milliseconds();
            stats.last_attempt = Some(outcome.timestamp);
            stats.last_error = outcome.error.clone();
        }

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(outcome);
    }

    /// Up to `limit` most recent outcomes, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ScrapeOutcome> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn domain_stats(&self, domain: &str) -> Option<DomainStats> {
        self.totals.lock().get(domain).cloned()
    }

    pub fn all_stats(&self) -> BTreeMap<String, DomainStats> {
        self.totals.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
