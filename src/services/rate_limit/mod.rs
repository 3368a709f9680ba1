// src/services/rate_limit/mod.rs

//! Per-domain admission control.
//!
//! Every domain is bound once to a named strategy profile: an explicit
//! override first, then the first matching platform pattern, then the
//! default profile. A block list is consulted before any strategy and is
//! the only way to force a denial.

mod strategy;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{RateLimitConfig, StrategySpec};
use crate::utils::normalize_domain;

pub use strategy::RateState;

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The request may proceed and has been counted
    Allowed,
    /// The domain is on the block list
    Blocked {
        reason: String,
        until: DateTime<Utc>,
    },
    /// The strategy refused; retry after `wait`
    Throttled { wait: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// How long until the domain could be admitted again.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Admission::Allowed => Duration::zero(),
            Admission::Blocked { until, .. } => (*until - now).max(Duration::zero()),
            Admission::Throttled { wait } => *wait,
        }
    }
}

/// A block list entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub reason: String,
    pub until: DateTime<Utc>,
}

/// Persisted state of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRateState {
    /// Profile the state was created under
    pub profile: String,
    pub state: RateState,
}

/// Everything the controller needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    #[serde(default)]
    pub states: BTreeMap<String, DomainRateState>,
    #[serde(default)]
    pub blocks: BTreeMap<String, BlockEntry>,
}

/// Operator view of one domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    pub profile: String,
    pub strategy: &'static str,
    pub limit: Option<u32>,
    pub failure_streak: Option<u32>,
    pub wait_secs: i64,
    pub blocked: Option<BlockEntry>,
    pub admitted: u64,
    pub throttled: u64,
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateStats {
    pub domains: usize,
    pub blocked_domains: usize,
    pub admitted: u64,
    pub throttled: u64,
    pub block_denials: u64,
}

#[derive(Debug)]
struct Limiter {
    profile: String,
    spec: StrategySpec,
    state: RateState,
    admitted: u64,
    throttled: u64,
}

impl Limiter {
    fn new(profile: String, spec: StrategySpec, now: DateTime<Utc>) -> Self {
        let state = RateState::new(&spec, now);
        Self {
            profile,
            spec,
            state,
            admitted: 0,
            throttled: 0,
        }
    }
}

/// Admission controller shared by all scheduler tasks.
pub struct RateController {
    profiles: BTreeMap<String, StrategySpec>,
    overrides: HashMap<String, String>,
    patterns: Vec<(Regex, String)>,
    default_profile: String,
    limiters: RwLock<HashMap<String, Arc<Mutex<Limiter>>>>,
    blocks: Mutex<HashMap<String, BlockEntry>>,
    admitted: AtomicU64,
    throttled: AtomicU64,
    block_denials: AtomicU64,
}

impl RateController {
    /// Build the controller from configuration.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        if !config.profiles.contains_key(&config.default_profile) {
            return Err(AppError::config(format!(
                "unknown default rate profile '{}'",
                config.default_profile
            )));
        }

        let mut patterns = Vec::with_capacity(config.patterns.len());
        for binding in &config.patterns {
            if !config.profiles.contains_key(&binding.profile) {
                return Err(AppError::config(format!(
                    "pattern '{}' refers to unknown profile '{}'",
                    binding.pattern, binding.profile
                )));
            }
            let regex = Regex::new(&binding.pattern)
                .map_err(|e| AppError::config(format!("invalid domain pattern: {e}")))?;
            patterns.push((regex, binding.profile.clone()));
        }

        // Keys are normalized the same way registry domains are.
        let mut overrides = HashMap::with_capacity(config.overrides.len());
        for (domain, profile) in &config.overrides {
            if !config.profiles.contains_key(profile) {
                return Err(AppError::config(format!(
                    "override for '{domain}' refers to unknown profile '{profile}'"
                )));
            }
            let key = normalize_domain(domain).ok_or_else(|| {
                AppError::config(format!("override key '{domain}' is not a valid domain"))
            })?;
            overrides.insert(key, profile.clone());
        }

        Ok(Self {
            profiles: config.profiles.clone(),
            overrides,
            patterns,
            default_profile: config.default_profile.clone(),
            limiters: RwLock::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            admitted: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            block_denials: AtomicU64::new(0),
        })
    }

    /// Name of the profile a domain is bound to.
    pub fn profile_for(&self, domain: &str) -> &str {
        if let Some(profile) = self.overrides.get(domain) {
            return profile;
        }
        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(domain))
            .map(|(_, profile)| profile.as_str())
            .unwrap_or(self.default_profile.as_str())
    }

    fn spec_for(&self, profile: &str) -> Option<&StrategySpec> {
        self.profiles.get(profile)
    }

    fn limiter(&self, domain: &str, now: DateTime<Utc>) -> Arc<Mutex<Limiter>> {
        if let Some(limiter) = self.limiters.read().get(domain) {
            return Arc::clone(limiter);
        }

        let mut limiters = self.limiters.write();
        let limiter = limiters.entry(domain.to_string()).or_insert_with(|| {
            let profile = self.profile_for(domain).to_string();
            let spec = self
                .spec_for(&profile)
                .or_else(|| self.spec_for(&self.default_profile))
                .cloned()
                .unwrap_or(StrategySpec::FixedWindow {
                    max_requests: 1,
                    window_secs: 60,
                });
            log::debug!("Rate profile '{}' bound to {}", profile, domain);
            Arc::new(Mutex::new(Limiter::new(profile, spec, now)))
        });
        Arc::clone(limiter)
    }

    fn active_block(&self, domain: &str, now: DateTime<Utc>) -> Option<BlockEntry> {
        let mut blocks = self.blocks.lock();
        match blocks.get(domain) {
            Some(entry) if entry.until > now => Some(entry.clone()),
            Some(_) => {
                blocks.remove(domain);
                log::info!("Block on {} expired", domain);
                None
            }
            None => None,
        }
    }

    /// Check and, when allowed, count one request for a domain.
    pub fn check(&self, domain: &str, now: DateTime<Utc>) -> Admission {
        if let Some(entry) = self.active_block(domain, now) {
            self.block_denials.fetch_add(1, Ordering::Relaxed);
            return Admission::Blocked {
                reason: entry.reason,
                until: entry.until,
            };
        }

        let limiter = self.limiter(domain, now);
        let mut guard = limiter.lock();
        let Limiter {
            spec,
            state,
            admitted,
            throttled,
            ..
        } = &mut *guard;

        if state.allow(spec, now) {
            *admitted += 1;
            self.admitted.fetch_add(1, Ordering::Relaxed);
            Admission::Allowed
        } else {
            *throttled += 1;
            self.throttled.fetch_add(1, Ordering::Relaxed);
            Admission::Throttled {
                wait: state.wait_time(spec, now),
            }
        }
    }

    /// Shorthand for `check(..).is_allowed()`.
    pub fn allow(&self, domain: &str, now: DateTime<Utc>) -> bool {
        self.check(domain, now).is_allowed()
    }

    /// Feed back the result of an admitted request.
    pub fn record(&self, domain: &str, now: DateTime<Utc>, success: bool) {
        let limiter = self.limiter(domain, now);
        let mut guard = limiter.lock();
        let Limiter { spec, state, .. } = &mut *guard;
        state.record(spec, now, success);
    }

    /// Time until the domain would be admitted, counting blocks.
    pub fn wait_time(&self, domain: &str, now: DateTime<Utc>) -> Duration {
        if let Some(entry) = self.active_block(domain, now) {
            return entry.until - now;
        }
        let limiter = self.limiters.read().get(domain).cloned();
        match limiter {
            Some(limiter) => {
                let guard = limiter.lock();
                guard.state.wait_time(&guard.spec, now)
            }
            None => Duration::zero(),
        }
    }

    /// Deny the domain until `now + duration`, replacing any existing block.
    pub fn block(
        &self,
        domain: &str,
        reason: impl Into<String>,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> BlockEntry {
        let entry = BlockEntry {
            reason: reason.into(),
            until: now + duration,
        };
        log::warn!(
            "Blocking {} until {} ({})",
            domain,
            entry.until.format("%Y-%m-%d %H:%M:%S"),
            entry.reason
        );
        self.blocks.lock().insert(domain.to_string(), entry.clone());
        entry
    }

    /// Lift a block. Returns whether one existed.
    pub fn unblock(&self, domain: &str) -> bool {
        let removed = self.blocks.lock().remove(domain).is_some();
        if removed {
            log::info!("Unblocked {}", domain);
        }
        removed
    }

    /// Drop expired blocks. Returns how many were removed.
    pub fn sweep_blocks(&self, now: DateTime<Utc>) -> usize {
        let mut blocks = self.blocks.lock();
        let before = blocks.len();
        blocks.retain(|_, entry| entry.until > now);
        let removed = before - blocks.len();
        if removed > 0 {
            log::info!("Swept {} expired block(s)", removed);
        }
        removed
    }

    /// Active blocks, sorted by domain.
    pub fn blocks(&self, now: DateTime<Utc>) -> Vec<(String, BlockEntry)> {
        let mut list: Vec<_> = self
            .blocks
            .lock()
            .iter()
            .filter(|(_, e)| e.until > now)
            .map(|(d, e)| (d.clone(), e.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub fn stats(&self, now: DateTime<Utc>) -> RateStats {
        RateStats {
            domains: self.limiters.read().len(),
            blocked_domains: self.blocks(now).len(),
            admitted: self.admitted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            block_denials: self.block_denials.load(Ordering::Relaxed),
        }
    }

    /// Current view of one domain. Does not create state.
    pub fn domain_status(&self, domain: &str, now: DateTime<Utc>) -> DomainStatus {
        let blocked = self.active_block(domain, now);
        let limiter = self.limiters.read().get(domain).cloned();
        let wait = self.wait_time(domain, now);

        match limiter {
            Some(limiter) => {
                let guard = limiter.lock();
                DomainStatus {
                    domain: domain.to_string(),
                    profile: guard.profile.clone(),
                    strategy: guard.spec.kind(),
                    limit: guard.state.current_limit(&guard.spec),
                    failure_streak: guard.state.failure_streak(),
                    wait_secs: wait.num_seconds(),
                    blocked,
                    admitted: guard.admitted,
                    throttled: guard.throttled,
                }
            }
            None => {
                let profile = self.profile_for(domain).to_string();
                let spec = self.spec_for(&profile);
                DomainStatus {
                    domain: domain.to_string(),
                    strategy: spec.map_or("unknown", StrategySpec::kind),
                    limit: spec.and_then(|s| RateState::new(s, now).current_limit(s)),
                    profile,
                    failure_streak: None,
                    wait_secs: wait.num_seconds(),
                    blocked,
                    admitted: 0,
                    throttled: 0,
                }
            }
        }
    }

    /// Copy out every domain's state and the block list.
    pub fn snapshot(&self) -> RateSnapshot {
        let states = self
            .limiters
            .read()
            .iter()
            .map(|(domain, limiter)| {
                let guard = limiter.lock();
                (
                    domain.clone(),
                    DomainRateState {
                        profile: guard.profile.clone(),
                        state: guard.state.clone(),
                    },
                )
            })
            .collect();
        let blocks = self
            .blocks
            .lock()
            .iter()
            .map(|(d, e)| (d.clone(), e.clone()))
            .collect();
        RateSnapshot { states, blocks }
    }

    /// Load persisted state. Entries whose binding changed are discarded.
    pub fn restore(&self, snapshot: RateSnapshot, now: DateTime<Utc>) -> usize {
        let mut restored = 0;
        let mut limiters = self.limiters.write();
        for (domain, persisted) in snapshot.states {
            let profile = self.profile_for(&domain);
            let Some(spec) = self.spec_for(profile) else {
                continue;
            };
            if profile != persisted.profile || !persisted.state.fits(spec) {
                log::debug!(
                    "Discarding rate state for {} (was '{}', now '{}')",
                    domain,
                    persisted.profile,
                    profile
                );
                continue;
            }
            let limiter = Limiter {
                profile: persisted.profile,
                spec: spec.clone(),
                state: persisted.state,
                admitted: 0,
                throttled: 0,
            };
            limiters.insert(domain, Arc::new(Mutex::new(limiter)));
            restored += 1;
        }
        drop(limiters);

        let mut blocks = self.blocks.lock();
        for (domain, entry) in snapshot.blocks {
            if entry.until > now {
                blocks.insert(domain, entry);
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PatternBinding;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn controller() -> RateController {
        RateController::new(&RateLimitConfig::default()).unwrap()
    }

    #[test]
    fn test_binds_profiles_by_override_pattern_and_default() {
        let mut config = RateLimitConfig::default();
        config
            .overrides
            .insert("amazon.com.br".into(), "scraper".into());
        let rate = RateController::new(&config).unwrap();

        assert_eq!(rate.profile_for("amazon.com.br"), "scraper");
        assert_eq!(rate.profile_for("amazon.com"), "amazon");
        assert_eq!(rate.profile_for("magazineluiza.com.br"), "magalu");
        assert_eq!(rate.profile_for("pt.aliexpress.com"), "aliexpress");
        assert_eq!(rate.profile_for("zoom.com.br"), "default_api");
    }

    #[test]
    fn test_override_keys_are_normalized() {
        let mut config = RateLimitConfig::default();
        config
            .overrides
            .insert("https://www.Pelando.com.br/hot".into(), "scraper".into());
        let rate = RateController::new(&config).unwrap();

        assert_eq!(rate.profile_for("pelando.com.br"), "scraper");
    }

    #[test]
    fn test_rejects_invalid_override_key() {
        let mut config = RateLimitConfig::default();
        config.overrides.insert("   ".into(), "scraper".into());
        assert!(RateController::new(&config).err().unwrap().is_config());
    }

    #[test]
    fn test_rejects_unknown_profile() {
        let mut config = RateLimitConfig::default();
        config.patterns.push(PatternBinding {
            pattern: "kabum".into(),
            profile: "missing".into(),
        });
        assert!(RateController::new(&config).is_err());
    }

    #[test]
    fn test_fixed_window_scenario() {
        let mut config = RateLimitConfig::default();
        config.profiles.insert(
            "tight".into(),
            StrategySpec::FixedWindow {
                max_requests: 3,
                window_secs: 60,
            },
        );
        config.default_profile = "tight".into();
        let rate = RateController::new(&config).unwrap();
        let t = t0();
        let s = Duration::seconds;

        assert!(rate.allow("a.example", t));
        assert!(rate.allow("a.example", t + s(1)));
        assert!(rate.allow("a.example", t + s(2)));
        assert_eq!(
            rate.check("a.example", t + s(3)),
            Admission::Throttled { wait: s(57) }
        );
        assert!(rate.allow("a.example", t + s(61)));
        // Domains do not share state.
        assert!(rate.allow("b.example", t + s(3)));
    }

    #[test]
    fn test_block_overrides_strategy_until_expiry() {
        let rate = controller();
        let t = t0();
        rate.block("pelando.com.br", "captcha wall", Duration::minutes(10), t);

        let admission = rate.check("pelando.com.br", t + Duration::minutes(5));
        assert!(matches!(admission, Admission::Blocked { .. }));
        assert_eq!(
            admission.retry_after(t + Duration::minutes(5)),
            Duration::minutes(5)
        );
        assert_eq!(
            rate.wait_time("pelando.com.br", t + Duration::minutes(5)),
            Duration::minutes(5)
        );

        assert!(rate.allow("pelando.com.br", t + Duration::minutes(10)));
        assert!(rate.blocks(t + Duration::minutes(10)).is_empty());
    }

    #[test]
    fn test_unblock_and_sweep() {
        let rate = controller();
        let t = t0();
        rate.block("a.example", "manual", Duration::minutes(1), t);
        rate.block("b.example", "manual", Duration::minutes(30), t);

        assert_eq!(rate.sweep_blocks(t + Duration::minutes(2)), 1);
        assert!(rate.unblock("b.example"));
        assert!(!rate.unblock("b.example"));
        assert!(rate.allow("b.example", t + Duration::minutes(2)));
    }

    #[test]
    fn test_record_drives_backoff_wait() {
        let mut config = RateLimitConfig::default();
        config
            .overrides
            .insert("fragile.example".into(), "backoff".into());
        let rate = RateController::new(&config).unwrap();
        let t = t0();

        assert!(rate.allow("fragile.example", t));
        rate.record("fragile.example", t, false);
        rate.record("fragile.example", t, false);
        assert_eq!(rate.wait_time("fragile.example", t), Duration::seconds(4));
        assert!(!rate.allow("fragile.example", t + Duration::seconds(3)));

        let status = rate.domain_status("fragile.example", t);
        assert_eq!(status.strategy, "exponential_backoff");
        assert_eq!(status.failure_streak, Some(2));
    }

    #[test]
    fn test_snapshot_restore_keeps_matching_bindings() {
        let rate = controller();
        let t = t0();
        for _ in 0..3 {
            assert!(rate.allow("promobit.com.br", t));
        }
        rate.block("amazon.com.br", "429 storm", Duration::hours(1), t);
        let snapshot = rate.snapshot();
        assert_eq!(snapshot.states.len(), 1);

        let fresh = controller();
        assert_eq!(fresh.restore(snapshot.clone(), t), 1);
        let status = fresh.domain_status("promobit.com.br", t);
        assert_eq!(status.profile, "promobit");
        assert!(matches!(
            fresh.check("amazon.com.br", t),
            Admission::Blocked { .. }
        ));

        // Rebinding the domain invalidates its persisted state.
        let mut config = RateLimitConfig::default();
        config
            .overrides
            .insert("promobit.com.br".into(), "scraper".into());
        let rebound = RateController::new(&config).unwrap();
        assert_eq!(rebound.restore(snapshot, t), 0);
    }
}
