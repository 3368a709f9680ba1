//! Source registry.
//!
//! Holds one descriptor per source behind its own mutex, so the scheduler's
//! tasks only contend when they touch the same source.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{ScrapeOutcome, SourceDescriptor};
use crate::utils::duration;

/// Extra weight for sources polled more often than hourly.
const FAST_CADENCE_BOOST: f64 = 1.3;
/// Cap on the overrun share added to the urgency multiplier.
const MAX_OVERRUN_BOOST: f64 = 1.5;

/// Scheduling score of a source; higher is polled first.
pub fn priority_score(source: &SourceDescriptor, now: DateTime<Utc>) -> f64 {
    let overrun_boost = match source.overrun(now) {
        Some(overrun) => duration::ratio(overrun, source.min_poll_interval).min(MAX_OVERRUN_BOOST),
        None => MAX_OVERRUN_BOOST,
    };
    let mut score = source.priority * source.category.weight() * (1.0 + overrun_boost);
    if source.min_poll_interval < Duration::hours(1) {
        score *= FAST_CADENCE_BOOST;
    }
    score
}

fn by_score(now: DateTime<Utc>) -> impl Fn(&SourceDescriptor, &SourceDescriptor) -> Ordering {
    move |a, b| {
        priority_score(b, now)
            .partial_cmp(&priority_score(a, now))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.domain.cmp(&b.domain))
    }
}

/// Changes applied by [`SourceRegistry::sync_from_config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    /// Present in the registry but no longer configured; disabled, not deleted
    pub retired: usize,
}

#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<BTreeMap<String, Arc<Mutex<SourceDescriptor>>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, domain: &str) -> Option<Arc<Mutex<SourceDescriptor>>> {
        self.sources.read().get(domain).cloned()
    }

    fn not_found(domain: &str) -> AppError {
        AppError::validation(format!("unknown source '{domain}'"))
    }

    /// Add a new source. Fails if the domain is already registered.
    pub fn register(&self, descriptor: SourceDescriptor) -> Result<()> {
        let mut sources = self.sources.write();
        if sources.contains_key(&descriptor.domain) {
            return Err(AppError::validation(format!(
                "source '{}' is already registered",
                descriptor.domain
            )));
        }
        log::debug!("Registered source {} ({})", descriptor.domain, descriptor.category);
        sources.insert(descriptor.domain.clone(), Arc::new(Mutex::new(descriptor)));
        Ok(())
    }

    /// Reconcile with the configured source table.
    ///
    /// Configured fields (name, category, priority, cadence, enabled) win;
    /// runtime fields of existing entries are kept. Entries missing from the
    /// configuration are disabled.
    pub fn sync_from_config(&self, configured: Vec<SourceDescriptor>) -> SyncReport {
        let mut report = SyncReport::default();
        let mut sources = self.sources.write();
        let mut seen = Vec::with_capacity(configured.len());

        for desc in configured {
            seen.push(desc.domain.clone());
            match sources.get(&desc.domain) {
                Some(existing) => {
                    let mut current = existing.lock();
                    current.name = desc.name;
                    current.category = desc.category;
                    current.priority = desc.priority;
                    current.min_poll_interval = desc.min_poll_interval;
                    current.enabled = desc.enabled;
                    report.updated += 1;
                }
                None => {
                    sources.insert(desc.domain.clone(), Arc::new(Mutex::new(desc)));
                    report.added += 1;
                }
            }
        }

        for (domain, entry) in sources.iter() {
            if seen.contains(domain) {
                continue;
            }
            let mut current = entry.lock();
            if current.enabled {
                current.enabled = false;
                report.retired += 1;
                log::info!("Source {} no longer configured; disabled", domain);
            }
        }
        report
    }

    pub fn get(&self, domain: &str) -> Option<SourceDescriptor> {
        self.entry(domain).map(|e| e.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every source, ordered by domain.
    pub fn list_all(&self) -> Vec<SourceDescriptor> {
        self.sources
            .read()
            .values()
            .map(|e| e.lock().clone())
            .collect()
    }

    /// Enabled sources whose cadence has elapsed, highest score first.
    pub fn list_due(&self, now: DateTime<Utc>) -> Vec<SourceDescriptor> {
        let mut due: Vec<_> = self
            .list_all()
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();
        due.sort_by(by_score(now));
        due
    }

    /// Every enabled source regardless of cadence, highest score first.
    pub fn list_enabled(&self, now: DateTime<Utc>) -> Vec<SourceDescriptor> {
        let mut enabled: Vec<_> = self
            .list_all()
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        enabled.sort_by(by_score(now));
        enabled
    }

    pub fn set_enabled(&self, domain: &str, enabled: bool) -> Result<()> {
        let entry = self.entry(domain).ok_or_else(|| Self::not_found(domain))?;
        entry.lock().enabled = enabled;
        log::info!(
            "Source {} {}",
            domain,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Earliest instant any enabled source becomes due.
    pub fn next_due_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.sources
            .read()
            .values()
            .filter_map(|e| {
                let s = e.lock();
                s.enabled.then(|| s.next_due_at().unwrap_or(now))
            })
            .min()
    }

    /// Record an attempt. `last_poll` never moves backwards.
    pub fn mark_processed(&self, outcome: &ScrapeOutcome, now: DateTime<Utc>) -> Result<()> {
        let entry = self
            .entry(&outcome.domain)
            .ok_or_else(|| Self::not_found(&outcome.domain))?;
        let mut source = entry.lock();

        source.last_poll = Some(source.last_poll.map_or(now, |last| last.max(now)));
        source.attempts += 1;
        if outcome.success {
            source.successes += 1;
            source.items_found += outcome.items_accepted as u64;
            source.last_success = Some(now);
        } else {
            source.failures += 1;
        }
        source.last_error = outcome.error.clone();
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<SourceDescriptor> {
        self.list_all()
    }

    /// Load persisted descriptors, replacing entries with the same domain.
    pub fn restore(&self, descriptors: Vec<SourceDescriptor>) -> usize {
        let mut sources = self.sources.write();
        let count = descriptors.len();
        for desc in descriptors {
            sources.insert(desc.domain.clone(), Arc::new(Mutex::new(desc)));
        }
        count
    }
}
