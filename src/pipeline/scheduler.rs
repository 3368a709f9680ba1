// src/pipeline/scheduler.rs

//! Scheduling loop.
//!
//! A cycle takes the due sources in priority order and fans them out as
//! tasks bounded by a semaphore. Each task passes the rate gate, fetches
//! under a timeout, filters duplicates, publishes, and reports back to the
//! registry, the rate controller and the outcome log. Nothing a task does
//! can fail the cycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::error::{AppError, FetchError, Result};
use crate::models::{Config, CycleReport, ScrapeOutcome, SourceDescriptor};
use crate::pipeline::adapter::{FetchAdapter, Sink};
use crate::pipeline::context::{EngineContext, RestoreReport};
use crate::pipeline::due_queue::DueQueue;
use crate::storage::SnapshotStore;
use crate::utils::{duration, normalize_domain};

/// How often fingerprints past retention are collected.
const DEDUP_GC_INTERVAL_MINS: i64 = 60;

/// Result of one source's turn in a cycle.
enum Attempt {
    Done {
        outcome: ScrapeOutcome,
        next_due: Option<DateTime<Utc>>,
    },
    Deferred {
        domain: String,
        retry_at: DateTime<Utc>,
    },
}

/// Where the engine's state came from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    Restored,
    /// No snapshot existed.
    Fresh,
    /// A snapshot existed but could not be loaded. Commands that only touch
    /// the state once should not write over it.
    Unreadable,
}

/// What a maintenance pass removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcReport {
    pub fingerprints: usize,
    pub blocks: usize,
    pub cache_entries: usize,
}

#[derive(Debug, Default)]
struct Housekeeping {
    last_gc: Option<DateTime<Utc>>,
    last_block_sweep: Option<DateTime<Utc>>,
    last_snapshot: Option<DateTime<Utc>>,
}

/// Aborts the wrapped task when dropped, so a cancelled cycle does not leave
/// fetches running behind it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Scheduler {
    ctx: Arc<EngineContext>,
    config: Arc<Config>,
    adapters: HashMap<String, Arc<dyn FetchAdapter>>,
    sink: Arc<dyn Sink>,
    store: Option<Arc<dyn SnapshotStore>>,
    semaphore: Arc<Semaphore>,
    queue: Mutex<DueQueue>,
    housekeeping: Mutex<Housekeeping>,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineContext>, config: Arc<Config>, sink: Arc<dyn Sink>) -> Self {
        let permits = config.scheduler.max_concurrent.max(1);
        Self {
            ctx,
            config,
            adapters: HashMap::new(),
            sink,
            store: None,
            semaphore: Arc::new(Semaphore::new(permits)),
            queue: Mutex::new(DueQueue::new()),
            housekeeping: Mutex::new(Housekeeping::default()),
        }
    }

    /// Register the adapter for a source.
    pub fn with_adapter(mut self, domain: &str, adapter: Arc<dyn FetchAdapter>) -> Self {
        let key = normalize_domain(domain).unwrap_or_else(|| domain.to_string());
        self.adapters.insert(key, adapter);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn has_adapter(&self, domain: &str) -> bool {
        self.adapters.contains_key(domain)
    }

    /// Run every source that is due now.
    pub async fn run_cycle(&self) -> CycleReport {
        let now = self.ctx.now();
        let due = self.ctx.registry.list_due(now);
        self.run_sources(due, now).await
    }

    /// Run every enabled source regardless of cadence. Rate limits and
    /// blocks still apply.
    pub async fn run_forced_cycle(&self) -> CycleReport {
        let now = self.ctx.now();
        let sources = self.ctx.registry.list_enabled(now);
        log::info!("Forced cycle over {} source(s)", sources.len());
        self.run_sources(sources, now).await
    }

    async fn run_sources(&self, sources: Vec<SourceDescriptor>, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport {
            due: sources.len(),
            ..CycleReport::default()
        };
        self.queue.lock().pop_due(now);

        if sources.is_empty() {
            return report;
        }
        log::debug!("Cycle: {} source(s) due", sources.len());

        let timeout = self.config.scheduler.fetch_timeout();
        let block_for = self.config.rate_limit.block_duration();
        let mut tasks = JoinSet::new();

        // Permits are taken in priority order, so higher scores start first.
        for source in sources {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = Arc::clone(&self.ctx);
            let adapter = self.adapters.get(&source.domain).cloned();
            let sink = Arc::clone(&self.sink);

            tasks.spawn(async move {
                let _permit = permit;
                attempt(ctx, adapter, sink, source, timeout, block_for).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Attempt::Done { outcome, next_due }) => {
                    report.absorb(&outcome);
                    if let Some(at) = next_due {
                        self.queue.lock().push(outcome.domain.clone(), at);
                    }
                }
                Ok(Attempt::Deferred { domain, retry_at }) => {
                    report.deferred += 1;
                    self.queue.lock().push(domain, retry_at);
                }
                Err(e) => {
                    log::error!("Source task failed: {}", e);
                    report.attempted += 1;
                    report.failed += 1;
                }
            }
        }

        report.elapsed = Duration::from_std(started.elapsed()).unwrap_or(Duration::zero());
        report
    }

    /// Reload the queue from the registry's cadence.
    pub fn rebuild_queue(&self) {
        let now = self.ctx.now();
        let mut queue = self.queue.lock();
        queue.clear();
        for source in self.ctx.registry.list_all() {
            if source.enabled {
                queue.push(source.domain.clone(), source.next_due_at().unwrap_or(now));
            }
        }
    }

    /// How long to sleep before the next cycle.
    pub fn idle_duration(&self, now: DateTime<Utc>) -> Duration {
        let min = self.config.scheduler.min_idle();
        let max = self.config.scheduler.max_idle();
        match self.queue.lock().peek_time() {
            Some(at) => (at - now).clamp(min, max),
            None => max,
        }
    }

    /// Remove expired state. Runs regardless of the housekeeping timers.
    pub fn collect_garbage(&self, now: DateTime<Utc>) -> GcReport {
        GcReport {
            fingerprints: self.ctx.dedup.gc(now, self.config.dedup.retention()),
            blocks: self.ctx.rate.sweep_blocks(now),
            cache_entries: self.ctx.cache.sweep_expired(),
        }
    }

    /// Periodic housekeeping between cycles.
    async fn maintain(&self) {
        let now = self.ctx.now();
        let elapsed = |last: Option<DateTime<Utc>>, every: Duration| {
            last.is_none_or(|t| now - t >= every)
        };

        let (gc, sweep, snapshot) = {
            let mut hk = self.housekeeping.lock();
            let gc = elapsed(hk.last_gc, Duration::minutes(DEDUP_GC_INTERVAL_MINS));
            let sweep = elapsed(hk.last_block_sweep, self.config.rate_limit.block_sweep_interval());
            let snapshot = hk.last_snapshot.is_some()
                && elapsed(hk.last_snapshot, self.config.storage.snapshot_interval());
            if gc {
                hk.last_gc = Some(now);
            }
            if sweep {
                hk.last_block_sweep = Some(now);
            }
            if hk.last_snapshot.is_none() || snapshot {
                hk.last_snapshot = Some(now);
            }
            (gc, sweep, snapshot)
        };

        if gc {
            self.ctx.dedup.gc(now, self.config.dedup.retention());
        }
        if sweep {
            self.ctx.rate.sweep_blocks(now);
        }
        self.ctx.cache.sweep_expired();
        if snapshot {
            if let Err(e) = self.persist().await {
                log::error!("Periodic snapshot failed: {}", e);
            }
        }
    }

    /// Write the current state to the snapshot store, if one is configured.
    pub async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.ctx.snapshot();
        store.save(&snapshot).await?;
        log::info!(
            "State saved to {} ({} sources, {} fingerprints)",
            store.location(),
            snapshot.sources.len(),
            snapshot.fingerprints.len()
        );
        Ok(())
    }

    /// Load state from the snapshot store. `None` when there was nothing to
    /// restore.
    pub async fn restore(&self) -> Result<Option<RestoreReport>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(snapshot) = store.load().await? else {
            log::info!("No snapshot at {}; starting fresh", store.location());
            return Ok(None);
        };

        let saved_at = snapshot.saved_at;
        let report = self.ctx.restore(snapshot, self.config.descriptors()?);
        log::info!(
            "Restored state from {} saved {}: {} sources, {} fingerprints, {} rate states",
            store.location(),
            saved_at.format("%Y-%m-%d %H:%M:%S"),
            report.sources,
            report.fingerprints,
            report.rate_states
        );
        Ok(Some(report))
    }

    /// Like [`restore`](Self::restore), but a snapshot that cannot be read
    /// is logged and the engine starts fresh instead.
    pub async fn restore_or_fresh(&self) -> StartState {
        match self.restore().await {
            Ok(Some(_)) => StartState::Restored,
            Ok(None) => StartState::Fresh,
            Err(e) => {
                log::error!("Could not restore state ({}); starting fresh", e);
                StartState::Unreadable
            }
        }
    }

    /// Drive cycles until `shutdown` resolves, then persist.
    pub async fn run<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let restored = self.restore_or_fresh().await == StartState::Restored;
        self.rebuild_queue();

        let mut stop = false;
        if self.config.scheduler.force_initial_cycle && !restored {
            stop = self.drive(self.run_forced_cycle(), shutdown.as_mut()).await;
        }

        while !stop {
            self.maintain().await;

            let idle = self.idle_duration(self.ctx.now());
            log::debug!("Sleeping {}s", idle.num_seconds());
            tokio::select! {
                _ = tokio::time::sleep(duration::to_std(idle)) => {}
                _ = shutdown.as_mut() => break,
            }

            stop = self.drive(self.run_cycle(), shutdown.as_mut()).await;
        }

        log::info!("Scheduler stopping");
        self.persist().await
    }

    /// Run one cycle to completion unless shutdown arrives first, in which
    /// case the cycle gets the grace period and is then dropped. Returns
    /// whether shutdown was requested.
    async fn drive<C, S>(&self, cycle: C, mut shutdown: std::pin::Pin<&mut S>) -> bool
    where
        C: Future<Output = CycleReport>,
        S: Future<Output = ()>,
    {
        tokio::pin!(cycle);
        tokio::select! {
            report = &mut cycle => {
                log_report(&report);
                false
            }
            _ = shutdown.as_mut() => {
                let grace = self.config.scheduler.shutdown_grace();
                log::info!(
                    "Shutdown requested; waiting up to {}s for in-flight fetches",
                    grace.num_seconds()
                );
                match tokio::time::timeout(duration::to_std(grace), &mut cycle).await {
                    Ok(report) => log_report(&report),
                    Err(_) => log::warn!("Grace period elapsed; aborting in-flight fetches"),
                }
                true
            }
        }
    }
}

fn log_report(report: &CycleReport) {
    if report.is_idle() {
        log::debug!("Cycle: nothing due");
        return;
    }
    log::info!(
        "Cycle: {} due, {} ok, {} failed, {} deferred; {} found, {} new, {} published ({}ms)",
        report.due,
        report.succeeded,
        report.failed,
        report.deferred,
        report.items_found,
        report.items_accepted,
        report.items_published,
        report.elapsed.num_milliseconds()
    );
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "fetch task cancelled".to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Call the adapter on its own task so a panic or a hang stays contained.
async fn fetch_guarded(
    adapter: Arc<dyn FetchAdapter>,
    source: SourceDescriptor,
    timeout: Duration,
) -> std::result::Result<Vec<crate::models::CandidateItem>, FetchError> {
    let mut task = AbortOnDrop(tokio::spawn(async move { adapter.fetch(&source).await }));
    match tokio::time::timeout(duration::to_std(timeout), &mut task.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(FetchError::Panicked(panic_message(join_err))),
        Err(_) => Err(FetchError::Timeout {
            secs: timeout.num_seconds().max(0) as u64,
        }),
    }
}

/// One source's turn: gate, fetch, dedup, publish, report.
///
/// A fetch refused with 403 or 429 also blocks the domain for `block_for`.
async fn attempt(
    ctx: Arc<EngineContext>,
    adapter: Option<Arc<dyn FetchAdapter>>,
    sink: Arc<dyn Sink>,
    source: SourceDescriptor,
    timeout: Duration,
    block_for: Duration,
) -> Attempt {
    let domain = source.domain.clone();
    let now = ctx.now();

    let admission = ctx.rate.check(&domain, now);
    if !admission.is_allowed() {
        let retry_at = now + admission.retry_after(now);
        log::info!(
            "Deferring {} until {} ({:?})",
            domain,
            retry_at.format("%H:%M:%S"),
            admission
        );
        return Attempt::Deferred { domain, retry_at };
    }

    let started = Instant::now();
    let result = match adapter {
        Some(adapter) => fetch_guarded(adapter, source, timeout).await,
        None => Err(FetchError::NoAdapter),
    };
    let finished = ctx.now();
    let elapsed = || Duration::from_std(started.elapsed()).unwrap_or(Duration::zero());

    let outcome = match result {
        Ok(items) => {
            let found = items.len();
            let accepted = ctx.dedup.filter(items, &domain, finished);
            let accepted_count = accepted.len();

            let mut publish_error = None;
            let mut published = 0;
            if !accepted.is_empty() {
                match tokio::time::timeout(duration::to_std(timeout), sink.publish(&accepted)).await
                {
                    Ok(Ok(n)) => published = n,
                    Ok(Err(e)) => publish_error = Some(AppError::from(e).to_string()),
                    Err(_) => publish_error = Some("publish timed out".to_string()),
                }
            }
            if let Some(err) = &publish_error {
                log::warn!("Publishing {} item(s) from {} failed: {}", accepted_count, domain, err);
            }

            ctx.rate.record(&domain, finished, true);
            log::info!(
                "{}: {} found, {} new, {} published",
                domain,
                found,
                accepted_count,
                published
            );
            let mut outcome =
                ScrapeOutcome::success(&domain, found, accepted_count, published, elapsed(), finished);
            outcome.error = publish_error;
            outcome
        }
        Err(e) => {
            ctx.rate.record(&domain, finished, false);
            log::warn!("{}: fetch failed: {}", domain, e);
            if e.is_blocking() {
                ctx.rate.block(&domain, e.to_string(), block_for, finished);
            }
            ScrapeOutcome::failure(&domain, e.to_string(), elapsed(), finished)
        }
    };

    if let Err(e) = ctx.registry.mark_processed(&outcome, finished) {
        log::error!("Could not update registry for {}: {}", domain, e);
    }
    ctx.outcomes.record(outcome.clone());

    let next_due = ctx.registry.get(&domain).and_then(|s| s.next_due_at());
    Attempt::Done { outcome, next_due }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::SinkError;
    use crate::models::{CandidateItem, SourceCategory, SourceConfig, StrategySpec};
    use crate::storage::LocalStorage;
    use crate::utils::clock::{Clock, ManualClock};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn source_config(domain: &str, minutes: u64) -> SourceConfig {
        SourceConfig {
            domain: domain.to_string(),
            name: None,
            category: SourceCategory::DealAggregator,
            priority: 1.0,
            min_poll_interval_secs: minutes * 60,
            enabled: true,
            feed_url: None,
            store_filter: None,
        }
    }

    fn config(domains: &[&str]) -> Config {
        let mut config = Config::default();
        config.sources = domains.iter().map(|d| source_config(d, 30)).collect();
        config.scheduler.fetch_timeout_secs = 5;
        config.rate_limit.patterns.clear();
        config.rate_limit.profiles.insert(
            "open".into(),
            StrategySpec::FixedWindow {
                max_requests: 100,
                window_secs: 60,
            },
        );
        config.rate_limit.default_profile = "open".into();
        config
    }

    struct StaticAdapter {
        items: Vec<CandidateItem>,
        calls: AtomicUsize,
    }

    impl StaticAdapter {
        fn new(items: Vec<CandidateItem>) -> Arc<Self> {
            Arc::new(Self {
                items,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FetchAdapter for StaticAdapter {
        async fn fetch(
            &self,
            _source: &SourceDescriptor,
        ) -> std::result::Result<Vec<CandidateItem>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.clone())
        }
    }

    struct FailingAdapter(u16);

    #[async_trait]
    impl FetchAdapter for FailingAdapter {
        async fn fetch(
            &self,
            _source: &SourceDescriptor,
        ) -> std::result::Result<Vec<CandidateItem>, FetchError> {
            Err(FetchError::Status { status: self.0 })
        }
    }

    struct PanickingAdapter;

    #[async_trait]
    impl FetchAdapter for PanickingAdapter {
        async fn fetch(
            &self,
            _source: &SourceDescriptor,
        ) -> std::result::Result<Vec<CandidateItem>, FetchError> {
            panic!("selector not found")
        }
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct HangingAdapter {
        started: AtomicBool,
        dropped: Arc<AtomicBool>,
    }

    impl HangingAdapter {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl FetchAdapter for HangingAdapter {
        async fn fetch(
            &self,
            _source: &SourceDescriptor,
        ) -> std::result::Result<Vec<CandidateItem>, FetchError> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        items: Mutex<Vec<CandidateItem>>,
    }

    #[async_trait]
    impl Sink for MemorySink {
        async fn publish(&self, items: &[CandidateItem]) -> std::result::Result<usize, SinkError> {
            self.items.lock().extend_from_slice(items);
            Ok(items.len())
        }
    }

    struct RejectingSink;

    #[async_trait]
    impl Sink for RejectingSink {
        async fn publish(&self, _items: &[CandidateItem]) -> std::result::Result<usize, SinkError> {
            Err(SinkError::Rejected("channel closed".into()))
        }
    }

    fn deals(t: DateTime<Utc>) -> Vec<CandidateItem> {
        vec![
            CandidateItem::new("Smartphone XYZ 128GB", 999.90, "AmazonBR", "https://a/1", t),
            CandidateItem::new("Headset Gamer 7.1", 249.90, "Kabum", "https://k/2", t),
        ]
    }

    fn engine(config: Config, clock: Arc<ManualClock>) -> (Arc<EngineContext>, Arc<Config>) {
        let ctx = Arc::new(EngineContext::from_config(&config, clock).unwrap());
        (ctx, Arc::new(config))
    }

    #[tokio::test]
    async fn test_cycle_fetches_dedups_and_publishes() {
        let clock = Arc::new(ManualClock::new(t0()));
        let mut cfg = config(&["promobit.com.br"]);
        cfg.sources[0].min_poll_interval_secs = 15 * 60;
        let (ctx, config) = engine(cfg, clock.clone());
        let sink = Arc::new(MemorySink::default());
        let adapter = StaticAdapter::new(deals(t0()));
        let scheduler = Scheduler::new(ctx.clone(), config, sink.clone())
            .with_adapter("promobit.com.br", adapter.clone());

        let report = scheduler.run_cycle().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.items_found, 2);
        assert_eq!(report.items_published, 2);
        assert_eq!(sink.items.lock().len(), 2);

        // Not due again until the interval has passed.
        clock.advance(Duration::minutes(5));
        assert!(scheduler.run_cycle().await.is_idle());

        // Due again, but the same items inside the window are suppressed.
        clock.advance(Duration::minutes(10));
        let report = scheduler.run_cycle().await;
        assert_eq!(report.items_found, 2);
        assert_eq!(report.items_accepted, 0);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.items.lock().len(), 2);

        let source = ctx.registry.get("promobit.com.br").unwrap();
        assert_eq!(source.last_poll, Some(t0() + Duration::minutes(15)));
        assert_eq!(source.items_found, 2);
    }

    #[tokio::test]
    async fn test_failures_are_contained_and_marked_processed() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(
            config(&["a.example", "b.example", "c.example", "d.example"]),
            clock,
        );
        let scheduler = Scheduler::new(ctx.clone(), config, Arc::new(MemorySink::default()))
            .with_adapter("a.example", Arc::new(FailingAdapter(503)))
            .with_adapter("b.example", Arc::new(PanickingAdapter))
            .with_adapter("c.example", StaticAdapter::new(deals(t0())));
        // d.example has no adapter.

        let report = scheduler.run_cycle().await;
        assert_eq!(report.attempted, 4);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 3);

        for domain in ["a.example", "b.example", "c.example", "d.example"] {
            let source = ctx.registry.get(domain).unwrap();
            assert_eq!(source.last_poll, Some(t0()), "{domain} marked processed");
        }
        let panicked = ctx.outcomes.domain_stats("b.example").unwrap();
        assert!(panicked.last_error.unwrap().contains("selector not found"));
        let missing = ctx.registry.get("d.example").unwrap();
        assert_eq!(missing.last_error.as_deref(), Some("no adapter registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_fetch_times_out() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(config(&["slow.example"]), clock);
        let scheduler = Scheduler::new(ctx.clone(), config, Arc::new(MemorySink::default()))
            .with_adapter("slow.example", HangingAdapter::new());

        let report = scheduler.run_cycle().await;
        assert_eq!(report.failed, 1);
        let stats = ctx.outcomes.domain_stats("slow.example").unwrap();
        assert_eq!(stats.last_error.as_deref(), Some("timed out after 5s"));
    }

    #[tokio::test]
    async fn test_throttled_source_is_deferred_not_failed() {
        let clock = Arc::new(ManualClock::new(t0()));
        let mut cfg = config(&["tight.example"]);
        cfg.rate_limit.profiles.insert(
            "one".into(),
            StrategySpec::FixedWindow {
                max_requests: 1,
                window_secs: 3600,
            },
        );
        cfg.rate_limit.default_profile = "one".into();
        cfg.sources[0].min_poll_interval_secs = 60;
        cfg.scheduler.max_idle_secs = 7200;
        let (ctx, config) = engine(cfg, clock.clone());
        let adapter = StaticAdapter::new(Vec::new());
        let scheduler = Scheduler::new(ctx.clone(), config, Arc::new(MemorySink::default()))
            .with_adapter("tight.example", adapter.clone());

        assert_eq!(scheduler.run_cycle().await.succeeded, 1);

        clock.advance(Duration::minutes(2));
        let report = scheduler.run_cycle().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        // Deferral does not count as processing.
        assert_eq!(
            ctx.registry.get("tight.example").unwrap().last_poll,
            Some(t0())
        );
        // The loop wakes when the window reopens, not before.
        assert_eq!(
            scheduler.idle_duration(clock.now()),
            Duration::minutes(58)
        );
    }

    #[tokio::test]
    async fn test_refused_fetch_blocks_domain() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(config(&["amazon.com.br"]), clock.clone());
        let scheduler = Scheduler::new(ctx.clone(), config, Arc::new(MemorySink::default()))
            .with_adapter("amazon.com.br", Arc::new(FailingAdapter(429)));

        let report = scheduler.run_cycle().await;
        assert_eq!(report.failed, 1);
        let block = ctx.rate.domain_status("amazon.com.br", t0()).blocked.unwrap();
        assert_eq!(block.until, t0() + Duration::minutes(60));
        assert!(block.reason.contains("429"));

        clock.advance(Duration::minutes(1));
        let report = scheduler.run_forced_cycle().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_server_error_does_not_block() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(config(&["a.example"]), clock);
        let scheduler = Scheduler::new(ctx.clone(), config, Arc::new(MemorySink::default()))
            .with_adapter("a.example", Arc::new(FailingAdapter(503)));

        assert_eq!(scheduler.run_cycle().await.failed, 1);
        assert!(ctx.rate.domain_status("a.example", t0()).blocked.is_none());
    }

    #[tokio::test]
    async fn test_blocked_source_is_skipped() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(config(&["blocked.example"]), clock);
        ctx.rate
            .block("blocked.example", "captcha", Duration::hours(1), t0());
        let adapter = StaticAdapter::new(Vec::new());
        let scheduler = Scheduler::new(ctx, config, Arc::new(MemorySink::default()))
            .with_adapter("blocked.example", adapter.clone());

        let report = scheduler.run_forced_cycle().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_source_healthy() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(config(&["promobit.com.br"]), clock);
        let scheduler = Scheduler::new(ctx.clone(), config, Arc::new(RejectingSink))
            .with_adapter("promobit.com.br", StaticAdapter::new(deals(t0())));

        let report = scheduler.run_cycle().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.items_accepted, 2);
        assert_eq!(report.items_published, 0);
        let recent = ctx.outcomes.recent(1);
        assert!(recent[0].error.as_deref().unwrap().contains("channel closed"));
    }

    #[tokio::test]
    async fn test_forced_cycle_ignores_cadence() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(config(&["promobit.com.br"]), clock.clone());
        let adapter = StaticAdapter::new(Vec::new());
        let scheduler = Scheduler::new(ctx, config, Arc::new(MemorySink::default()))
            .with_adapter("promobit.com.br", adapter.clone());

        scheduler.run_cycle().await;
        clock.advance(Duration::minutes(1));
        assert!(scheduler.run_cycle().await.is_idle());
        assert_eq!(scheduler.run_forced_cycle().await.succeeded, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_persists_on_shutdown_and_restores_cadence() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let clock = Arc::new(ManualClock::new(t0()));

        let (ctx, config) = engine(config(&["promobit.com.br"]), clock.clone());
        let adapter = StaticAdapter::new(deals(t0()));
        let scheduler = Scheduler::new(ctx, config.clone(), Arc::new(MemorySink::default()))
            .with_adapter("promobit.com.br", adapter.clone())
            .with_store(Arc::new(LocalStorage::new(&path)));

        // Shut down as soon as the forced cycle has finished.
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = scheduler.run(async move {
            let _ = rx.await;
        });
        let watched = adapter.clone();
        let stopper = async move {
            while watched.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            let _ = tx.send(());
        };
        let (result, _) = tokio::join!(run, stopper);
        result.unwrap();
        assert!(path.exists());

        // A restart inside the interval restores cadence and skips the
        // forced cycle.
        clock.advance(Duration::minutes(5));
        let (ctx, _) = engine((*config).clone(), clock.clone());
        let again = StaticAdapter::new(deals(t0()));
        let restarted = Scheduler::new(ctx.clone(), config, Arc::new(MemorySink::default()))
            .with_adapter("promobit.com.br", again.clone())
            .with_store(Arc::new(LocalStorage::new(&path)));

        let report = restarted.restore().await.unwrap().unwrap();
        assert_eq!(report.fingerprints, 2);
        assert!(restarted.run_cycle().await.is_idle());
        assert_eq!(again.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_hanging_fetch_and_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let clock = Arc::new(ManualClock::new(t0()));

        let mut cfg = config(&["slow.example"]);
        cfg.scheduler.fetch_timeout_secs = 7200;
        cfg.scheduler.shutdown_grace_secs = 1;
        let (ctx, config) = engine(cfg, clock);
        let adapter = HangingAdapter::new();
        let scheduler = Scheduler::new(ctx, config, Arc::new(MemorySink::default()))
            .with_adapter("slow.example", adapter.clone())
            .with_store(Arc::new(LocalStorage::new(&path)));

        // Ask for shutdown once the forced cycle is stuck inside the fetch.
        let watched = adapter.clone();
        let shutdown = async move {
            while !watched.started.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        };
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            scheduler.run(shutdown),
        )
        .await
        .expect("run returns after the grace period");
        result.unwrap();
        assert!(path.exists());

        for _ in 0..10 {
            if adapter.dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(adapter.dropped.load(Ordering::SeqCst), "fetch task aborted");
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_starts_fresh() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let clock = Arc::new(ManualClock::new(t0()));

        let (ctx, config) = engine(config(&["promobit.com.br"]), clock);
        let scheduler = Scheduler::new(ctx, config, Arc::new(MemorySink::default()))
            .with_adapter("promobit.com.br", StaticAdapter::new(deals(t0())))
            .with_store(Arc::new(LocalStorage::new(&path)));

        assert!(scheduler.restore().await.is_err());
        assert_eq!(scheduler.restore_or_fresh().await, StartState::Unreadable);
        // The engine still works from fresh state.
        assert_eq!(scheduler.run_cycle().await.succeeded, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_fresh() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, config) = engine(config(&["promobit.com.br"]), clock);
        let scheduler = Scheduler::new(ctx, config, Arc::new(MemorySink::default()))
            .with_store(Arc::new(LocalStorage::new(dir.path().join("state.json"))));

        assert_eq!(scheduler.restore_or_fresh().await, StartState::Fresh);
    }
}
