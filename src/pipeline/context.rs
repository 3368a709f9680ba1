//! Shared engine state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{Config, ScrapeOutcome, SourceDescriptor};
use crate::pipeline::adapter::FeedCache;
use crate::pipeline::outcome::{DomainStats, OutcomeLog};
use crate::services::{
    BlockEntry, CacheStats, DedupIndex, DedupStats, RateController, RateStats, SourceRegistry,
    TtlCache, priority_score,
};
use crate::storage::EngineSnapshot;
use crate::utils::clock::Clock;

/// Everything the scheduler's tasks share. Passed around explicitly; there
/// are no globals.
pub struct EngineContext {
    pub registry: SourceRegistry,
    pub dedup: DedupIndex,
    pub rate: RateController,
    pub cache: Arc<FeedCache>,
    pub outcomes: OutcomeLog,
    pub clock: Arc<dyn Clock>,
}

/// What a restore brought back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreReport {
    pub sources: usize,
    pub fingerprints: usize,
    pub rate_states: usize,
}

/// One row of the status report.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    #[serde(flatten)]
    pub source: SourceDescriptor,
    pub score: f64,
    pub due: bool,
    pub next_due_at: Option<DateTime<Utc>>,
    pub rate_profile: String,
    pub blocked: Option<BlockEntry>,
}

/// Operator view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceStatus>,
    pub rate: RateStats,
    pub dedup: DedupStats,
    pub cache: CacheStats,
    pub domains: BTreeMap<String, DomainStats>,
    pub recent: Vec<ScrapeOutcome>,
}

impl EngineContext {
    /// Build every service from configuration and register the configured
    /// sources.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = SourceRegistry::new();
        registry.sync_from_config(config.descriptors()?);

        Ok(Self {
            registry,
            dedup: DedupIndex::new(&config.dedup),
            rate: RateController::new(&config.rate_limit)?,
            cache: Arc::new(TtlCache::new(
                config.cache.max_entries,
                config.cache.ttl(),
                Arc::clone(&clock),
            )),
            outcomes: OutcomeLog::new(config.scheduler.outcome_history),
            clock,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::new(
            self.now(),
            self.registry.snapshot(),
            self.dedup.snapshot(),
            self.rate.snapshot(),
        )
    }

    /// Apply a persisted snapshot, then re-apply the configured source table
    /// so configuration changes made while the engine was down take effect.
    pub fn restore(
        &self,
        snapshot: EngineSnapshot,
        configured: Vec<SourceDescriptor>,
    ) -> RestoreReport {
        let now = self.now();
        let report = RestoreReport {
            sources: self.registry.restore(snapshot.sources),
            fingerprints: self.dedup.restore(snapshot.fingerprints),
            rate_states: self.rate.restore(snapshot.rate, now),
        };
        self.registry.sync_from_config(configured);
        report
    }

    pub fn status(&self, recent: usize) -> EngineStatus {
        let now = self.now();
        let mut sources: Vec<_> = self
            .registry
            .list_all()
            .into_iter()
            .map(|source| {
                let status = self.rate.domain_status(&source.domain, now);
                SourceStatus {
                    score: priority_score(&source, now),
                    due: source.is_due(now),
                    next_due_at: source.next_due_at(),
                    rate_profile: status.profile,
                    blocked: status.blocked,
                    source,
                }
            })
            .collect();
        sources.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.domain.cmp(&b.source.domain))
        });

        EngineStatus {
            generated_at: now,
            sources,
            rate: self.rate.stats(now),
            dedup: self.dedup.stats(),
            cache: self.cache.stats(),
            domains: self.outcomes.all_stats(),
            recent: self.outcomes.recent(recent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CandidateItem;
    use crate::utils::clock::ManualClock;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_default_config_registers_known_sites() {
        let ctx = EngineContext::from_config(&Config::default(), Arc::new(ManualClock::new(t0())))
            .unwrap();
        assert_eq!(ctx.registry.len(), 9);
        assert_eq!(
            ctx.registry.get("promobit.com.br").unwrap().min_poll_interval,
            Duration::minutes(30)
        );

        let status = ctx.status(10);
        assert_eq!(status.sources.len(), 9);
        assert!(status.sources.iter().all(|s| s.due));
        assert_eq!(status.sources[0].source.domain, "pelando.com.br");
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let clock = Arc::new(ManualClock::new(t0()));
        let config = Config::default();
        let ctx = EngineContext::from_config(&config, clock.clone()).unwrap();

        let t = t0();
        let outcome = ScrapeOutcome::success("zoom.com.br", 1, 1, 1, Duration::seconds(1), t);
        ctx.registry.mark_processed(&outcome, t).unwrap();
        let item = CandidateItem::new("Monitor 27 IPS", 1299.0, "Kabum", "https://k/m", t);
        assert!(!ctx.dedup.is_duplicate(&item, "zoom.com.br", t));
        assert!(ctx.rate.allow("zoom.com.br", t));

        let json = serde_json::to_string(&ctx.snapshot()).unwrap();
        let snapshot: EngineSnapshot = serde_json::from_str(&json).unwrap();

        let fresh = EngineContext::from_config(&config, clock).unwrap();
        let report = fresh.restore(snapshot, config.descriptors().unwrap());
        assert_eq!(report.sources, 9);
        assert_eq!(report.fingerprints, 1);
        assert_eq!(report.rate_states, 1);
        assert_eq!(fresh.registry.get("zoom.com.br").unwrap().last_poll, Some(t));
        assert!(fresh.dedup.is_duplicate(&item, "zoom.com.br", t + Duration::minutes(1)));
    }
}
