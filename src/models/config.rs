//! Application configuration structures.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{SourceCategory, SourceDescriptor};
use crate::utils::{duration, normalize_domain};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cycle, concurrency and timeout settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Duplicate suppression windows
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Shared lookup cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Strategy profiles and domain bindings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Snapshot persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP client used by the bundled adapters
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where accepted items go
    #[serde(default)]
    pub sink: SinkConfig,

    /// Source table
    #[serde(default = "defaults::sources")]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(AppError::config("scheduler.max_concurrent must be > 0"));
        }
        if self.scheduler.fetch_timeout_secs == 0 {
            return Err(AppError::config("scheduler.fetch_timeout_secs must be > 0"));
        }
        if self.scheduler.outcome_history == 0 {
            return Err(AppError::config("scheduler.outcome_history must be > 0"));
        }

        self.dedup.validate()?;

        if self.cache.max_entries == 0 {
            return Err(AppError::config("cache.max_entries must be > 0"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(AppError::config("cache.ttl_secs must be > 0"));
        }

        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::config("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::config("http.timeout_secs must be > 0"));
        }

        self.rate_limit.validate()?;

        if self.sink.kind == SinkKind::Webhook && self.sink.url.is_none() {
            return Err(AppError::config("sink.url is required for the webhook sink"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let domain = source.validate()?;
            if !seen.insert(domain.clone()) {
                return Err(AppError::config(format!("duplicate source domain '{domain}'")));
            }
        }
        Ok(())
    }

    /// Build registry descriptors for every configured source.
    pub fn descriptors(&self) -> Result<Vec<SourceDescriptor>> {
        self.sources.iter().map(SourceConfig::to_descriptor).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            dedup: DedupConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            storage: StorageConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            sink: SinkConfig::default(),
            sources: defaults::sources(),
        }
    }
}

/// Scheduling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum fetches in flight at once
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Per-fetch timeout in seconds
    #[serde(default = "defaults::fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Attempt every enabled source once at startup, ignoring cadence
    #[serde(default = "defaults::force_initial_cycle")]
    pub force_initial_cycle: bool,

    /// How long shutdown waits for in-flight fetches
    #[serde(default = "defaults::shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Shortest sleep between cycles
    #[serde(default = "defaults::min_idle")]
    pub min_idle_secs: u64,

    /// Longest sleep between cycles when nothing is queued
    #[serde(default = "defaults::max_idle")]
    pub max_idle_secs: u64,

    /// Outcome records kept for operators
    #[serde(default = "defaults::outcome_history")]
    pub outcome_history: usize,
}

impl SchedulerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn min_idle(&self) -> Duration {
        duration::from_secs(self.min_idle_secs)
    }

    pub fn max_idle(&self) -> Duration {
        duration::from_secs(self.max_idle_secs.max(self.min_idle_secs))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            fetch_timeout_secs: defaults::fetch_timeout(),
            force_initial_cycle: defaults::force_initial_cycle(),
            shutdown_grace_secs: defaults::shutdown_grace(),
            min_idle_secs: defaults::min_idle(),
            max_idle_secs: defaults::max_idle(),
            outcome_history: defaults::outcome_history(),
        }
    }
}

/// Duplicate suppression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Same item on the same platform is suppressed for this long
    #[serde(default = "defaults::platform_window")]
    pub platform_window_mins: u64,

    /// Same item on any platform is suppressed for this long
    #[serde(default = "defaults::cross_platform_window")]
    pub cross_platform_window_mins: u64,

    /// Fingerprints unseen for this long are dropped
    #[serde(default = "defaults::retention")]
    pub retention_days: u64,

    /// Significant title tokens kept in the fingerprint
    #[serde(default = "defaults::title_tokens")]
    pub title_tokens: usize,

    /// Tokens shorter than this are ignored
    #[serde(default = "defaults::min_token_chars")]
    pub min_token_chars: usize,

    #[serde(default = "defaults::stop_words")]
    pub stop_words: Vec<String>,
}

impl DedupConfig {
    pub fn platform_window(&self) -> Duration {
        duration::from_secs(self.platform_window_mins.saturating_mul(60))
    }

    pub fn cross_platform_window(&self) -> Duration {
        duration::from_secs(self.cross_platform_window_mins.saturating_mul(60))
    }

    pub fn retention(&self) -> Duration {
        duration::from_secs(self.retention_days.saturating_mul(86_400))
    }

    fn validate(&self) -> Result<()> {
        if self.platform_window_mins == 0 {
            return Err(AppError::config("dedup.platform_window_mins must be > 0"));
        }
        if self.cross_platform_window_mins == 0 {
            return Err(AppError::config(
                "dedup.cross_platform_window_mins must be > 0",
            ));
        }
        if self.title_tokens == 0 {
            return Err(AppError::config("dedup.title_tokens must be > 0"));
        }
        if self.retention() < self.platform_window() {
            return Err(AppError::config(
                "dedup.retention_days must cover the platform window",
            ));
        }
        Ok(())
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            platform_window_mins: defaults::platform_window(),
            cross_platform_window_mins: defaults::cross_platform_window(),
            retention_days: defaults::retention(),
            title_tokens: defaults::title_tokens(),
            min_token_chars: defaults::min_token_chars(),
            stop_words: defaults::stop_words(),
        }
    }
}

/// Lookup cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "defaults::cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "defaults::cache_max_entries")]
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::cache_ttl(),
            max_entries: defaults::cache_max_entries(),
        }
    }
}

/// Parameters of one admission strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategySpec {
    /// At most `max_requests` per window; the window restarts when it expires
    FixedWindow { max_requests: u32, window_secs: u64 },

    /// At most `max_requests` in any trailing window
    SlidingWindow { max_requests: u32, window_secs: u64 },

    /// Fixed window whose limit follows the observed success ratio
    AdaptiveWindow {
        initial: u32,
        min: u32,
        max: u32,
        window_secs: u64,
        #[serde(default = "defaults::adjustment_interval")]
        adjustment_interval_secs: u64,
    },

    /// Growing pause after consecutive failures
    ExponentialBackoff {
        base_secs: f64,
        cap_secs: f64,
        multiplier: f64,
    },
}

impl StrategySpec {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategySpec::FixedWindow { .. } => "fixed_window",
            StrategySpec::SlidingWindow { .. } => "sliding_window",
            StrategySpec::AdaptiveWindow { .. } => "adaptive_window",
            StrategySpec::ExponentialBackoff { .. } => "exponential_backoff",
        }
    }

    /// Check parameter sanity.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            StrategySpec::FixedWindow {
                max_requests,
                window_secs,
            }
            | StrategySpec::SlidingWindow {
                max_requests,
                window_secs,
            } => {
                if max_requests == 0 {
                    return Err("max_requests must be > 0".into());
                }
                if window_secs == 0 {
                    return Err("window_secs must be > 0".into());
                }
            }
            StrategySpec::AdaptiveWindow {
                initial,
                min,
                max,
                window_secs,
                adjustment_interval_secs,
            } => {
                if min == 0 {
                    return Err("min must be > 0".into());
                }
                if !(min <= initial && initial <= max) {
                    return Err(format!("expected min <= initial <= max, got {min}/{initial}/{max}"));
                }
                if window_secs == 0 || adjustment_interval_secs == 0 {
                    return Err("window_secs and adjustment_interval_secs must be > 0".into());
                }
            }
            StrategySpec::ExponentialBackoff {
                base_secs,
                cap_secs,
                multiplier,
            } => {
                if !(base_secs.is_finite() && base_secs > 0.0) {
                    return Err("base_secs must be > 0".into());
                }
                if !(cap_secs.is_finite() && cap_secs >= base_secs) {
                    return Err("cap_secs must be >= base_secs".into());
                }
                if !(multiplier.is_finite() && multiplier >= 1.0) {
                    return Err("multiplier must be >= 1.0".into());
                }
            }
        }
        Ok(())
    }
}

/// Domain pattern bound to a strategy profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternBinding {
    /// Regex matched against the normalized domain
    pub pattern: String,
    pub profile: String,
}

/// Rate limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Named strategy profiles
    #[serde(default = "defaults::profiles")]
    pub profiles: BTreeMap<String, StrategySpec>,

    /// Platform families, checked in order after overrides
    #[serde(default = "defaults::patterns")]
    pub patterns: Vec<PatternBinding>,

    /// Exact domain to profile bindings
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,

    /// Profile for domains nothing else matches
    #[serde(default = "defaults::default_profile")]
    pub default_profile: String,

    /// Default block duration for `block` without an explicit one
    #[serde(default = "defaults::block_minutes")]
    pub block_minutes: u64,

    /// Interval of the expired-block sweep
    #[serde(default = "defaults::block_sweep")]
    pub block_sweep_secs: u64,
}

impl RateLimitConfig {
    fn validate(&self) -> Result<()> {
        for (name, spec) in &self.profiles {
            spec.validate().map_err(|e| {
                AppError::config(format!("rate_limit.profiles.{name}: {e}"))
            })?;
        }

        let known = |profile: &str| self.profiles.contains_key(profile);
        if !known(&self.default_profile) {
            return Err(AppError::config(format!(
                "rate_limit.default_profile '{}' is not a defined profile",
                self.default_profile
            )));
        }
        for binding in &self.patterns {
            if !known(&binding.profile) {
                return Err(AppError::config(format!(
                    "pattern '{}' refers to unknown profile '{}'",
                    binding.pattern, binding.profile
                )));
            }
            Regex::new(&binding.pattern).map_err(|e| {
                AppError::config(format!("invalid domain pattern '{}': {e}", binding.pattern))
            })?;
        }
        for (domain, profile) in &self.overrides {
            if !known(profile) {
                return Err(AppError::config(format!(
                    "override for '{domain}' refers to unknown profile '{profile}'"
                )));
            }
            if normalize_domain(domain).is_none() {
                return Err(AppError::config(format!(
                    "rate_limit.overrides: '{domain}' is not a valid domain"
                )));
            }
        }
        Ok(())
    }

    pub fn block_duration(&self) -> Duration {
        duration::from_secs(self.block_minutes.saturating_mul(60))
    }

    pub fn block_sweep_interval(&self) -> Duration {
        duration::from_secs(self.block_sweep_secs.max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            profiles: defaults::profiles(),
            patterns: defaults::patterns(),
            overrides: BTreeMap::new(),
            default_profile: defaults::default_profile(),
            block_minutes: defaults::block_minutes(),
            block_sweep_secs: defaults::block_sweep(),
        }
    }
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Snapshot document location
    #[serde(default = "defaults::snapshot_path")]
    pub snapshot_path: String,

    /// Minimum time between periodic snapshots
    #[serde(default = "defaults::snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl StorageConfig {
    /// Resolve the snapshot path against a base directory when relative.
    pub fn snapshot_file(&self, base: &Path) -> PathBuf {
        let path = PathBuf::from(&self.snapshot_path);
        if path.is_absolute() {
            path
        } else {
            base.join(path)
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        duration::from_secs(self.snapshot_interval_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: defaults::snapshot_path(),
            snapshot_interval_secs: defaults::snapshot_interval(),
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    #[serde(default = "defaults::http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// Sink backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// One JSON document per line on stdout
    #[default]
    Stdout,
    /// POST the batch as a JSON array
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    #[serde(default)]
    pub url: Option<String>,
}

/// One row of the source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Domain or URL identifying the source
    pub domain: String,

    /// Display name (defaults to the domain)
    #[serde(default)]
    pub name: Option<String>,

    pub category: SourceCategory,

    #[serde(default = "defaults::priority")]
    pub priority: f64,

    pub min_poll_interval_secs: u64,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// JSON feed served by an affiliate API or a scraper sidecar
    #[serde(default)]
    pub feed_url: Option<String>,

    /// Keep only feed items whose store matches (case-insensitive)
    #[serde(default)]
    pub store_filter: Option<String>,
}

impl SourceConfig {
    /// Normalized domain of the source.
    pub fn normalized_domain(&self) -> Option<String> {
        normalize_domain(&self.domain)
    }

    /// Check the row and return its normalized domain.
    pub fn validate(&self) -> Result<String> {
        let domain = self
            .normalized_domain()
            .ok_or_else(|| AppError::config(format!("invalid source domain '{}'", self.domain)))?;
        if self.min_poll_interval_secs == 0 {
            return Err(AppError::config(format!(
                "source '{domain}': min_poll_interval_secs must be > 0"
            )));
        }
        if !(self.priority.is_finite() && self.priority > 0.0) {
            return Err(AppError::config(format!(
                "source '{domain}': priority must be a positive number"
            )));
        }
        if let Some(url) = &self.feed_url {
            url::Url::parse(url).map_err(|e| {
                AppError::config(format!("source '{domain}': invalid feed_url: {e}"))
            })?;
        }
        Ok(domain)
    }

    /// Build the registry descriptor for this row.
    pub fn to_descriptor(&self) -> Result<SourceDescriptor> {
        let domain = self.validate()?;
        let name = self.name.clone().unwrap_or_else(|| domain.clone());
        let mut descriptor = SourceDescriptor::new(
            domain,
            name,
            self.category,
            duration::from_secs(self.min_poll_interval_secs),
        )
        .with_priority(self.priority);
        descriptor.enabled = self.enabled;
        Ok(descriptor)
    }
}

mod defaults {
    use std::collections::BTreeMap;

    use super::{PatternBinding, SourceCategory, SourceConfig, StrategySpec};

    // Scheduler defaults
    pub fn max_concurrent() -> usize {
        3
    }
    pub fn fetch_timeout() -> u64 {
        60
    }
    pub fn force_initial_cycle() -> bool {
        true
    }
    pub fn shutdown_grace() -> u64 {
        10
    }
    pub fn min_idle() -> u64 {
        1
    }
    pub fn max_idle() -> u64 {
        300
    }
    pub fn outcome_history() -> usize {
        1000
    }

    // Dedup defaults
    pub fn platform_window() -> u64 {
        30
    }
    pub fn cross_platform_window() -> u64 {
        15
    }
    pub fn retention() -> u64 {
        30
    }
    pub fn title_tokens() -> usize {
        5
    }
    pub fn min_token_chars() -> usize {
        3
    }
    pub fn stop_words() -> Vec<String> {
        [
            "o", "a", "de", "da", "do", "em", "para", "com", "sem", "por", "the", "and", "for",
            "with",
        ]
        .iter()
        .map(|w| w.to_string())
        .collect()
    }

    // Cache defaults
    pub fn cache_ttl() -> u64 {
        300
    }
    pub fn cache_max_entries() -> usize {
        1000
    }

    // Rate limit defaults
    pub fn adjustment_interval() -> u64 {
        60
    }
    pub fn default_profile() -> String {
        "default_api".into()
    }
    pub fn block_minutes() -> u64 {
        60
    }
    pub fn block_sweep() -> u64 {
        60
    }
    pub fn profiles() -> BTreeMap<String, StrategySpec> {
        let mut p = BTreeMap::new();
        p.insert(
            "default_api".into(),
            StrategySpec::FixedWindow {
                max_requests: 100,
                window_secs: 3600,
            },
        );
        p.insert(
            "scraper".into(),
            StrategySpec::SlidingWindow {
                max_requests: 30,
                window_secs: 300,
            },
        );
        p.insert(
            "amazon".into(),
            StrategySpec::AdaptiveWindow {
                initial: 20,
                min: 5,
                max: 50,
                window_secs: 3600,
                adjustment_interval_secs: adjustment_interval(),
            },
        );
        p.insert(
            "aliexpress".into(),
            StrategySpec::FixedWindow {
                max_requests: 50,
                window_secs: 3600,
            },
        );
        p.insert(
            "magalu".into(),
            StrategySpec::SlidingWindow {
                max_requests: 20,
                window_secs: 300,
            },
        );
        p.insert(
            "promobit".into(),
            StrategySpec::AdaptiveWindow {
                initial: 15,
                min: 3,
                max: 30,
                window_secs: 300,
                adjustment_interval_secs: adjustment_interval(),
            },
        );
        p.insert(
            "awin".into(),
            StrategySpec::FixedWindow {
                max_requests: 200,
                window_secs: 3600,
            },
        );
        p.insert(
            "backoff".into(),
            StrategySpec::ExponentialBackoff {
                base_secs: 1.0,
                cap_secs: 300.0,
                multiplier: 2.0,
            },
        );
        p
    }
    pub fn patterns() -> Vec<PatternBinding> {
        [
            ("amazon", "amazon"),
            ("aliexpress", "aliexpress"),
            ("magalu|magazine", "magalu"),
            ("promobit", "promobit"),
            ("awin", "awin"),
        ]
        .iter()
        .map(|(pattern, profile)| PatternBinding {
            pattern: pattern.to_string(),
            profile: profile.to_string(),
        })
        .collect()
    }

    // Storage defaults
    pub fn snapshot_path() -> String {
        "data/state.json".into()
    }
    pub fn snapshot_interval() -> u64 {
        300
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; dealwatch/0.1)".into()
    }
    pub fn http_timeout() -> u64 {
        30
    }

    pub fn log_level() -> String {
        "info".into()
    }

    // Source defaults
    pub fn priority() -> f64 {
        1.0
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn sources() -> Vec<SourceConfig> {
        [
            ("buscape.com.br", "Buscapé", SourceCategory::PriceComparison, 7200),
            ("zoom.com.br", "Zoom", SourceCategory::PriceComparison, 3600),
            ("promobit.com.br", "Promobit", SourceCategory::DealAggregator, 1800),
            ("pelando.com.br", "Pelando", SourceCategory::DealAggregator, 1800),
            ("meupc.net", "MeuPC.net", SourceCategory::HardwareSpecialist, 3600),
            ("amazon.com.br", "Amazon", SourceCategory::Ecommerce, 3600),
            ("shopee.com.br", "Shopee", SourceCategory::Marketplace, 3600),
            ("mercadolivre.com.br", "MercadoLivre", SourceCategory::Marketplace, 3600),
            ("aliexpress.com", "AliExpress", SourceCategory::Ecommerce, 7200),
        ]
        .iter()
        .map(|&(domain, name, category, secs)| SourceConfig {
            domain: domain.to_string(),
            name: Some(name.to_string()),
            category,
            priority: priority(),
            min_poll_interval_secs: secs,
            enabled: enabled(),
            feed_url: None,
            store_filter: None,
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.scheduler.max_concurrent = 0;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_validate_rejects_unknown_profile_binding() {
        let mut config = Config::default();
        config
            .rate_limit
            .overrides
            .insert("pelando.com.br".into(), "nope".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_invalid_override_key() {
        let mut config = Config::default();
        config
            .rate_limit
            .overrides
            .insert("".into(), "scraper".into());
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = Config::default();
        config.rate_limit.patterns.push(PatternBinding {
            pattern: "(unclosed".into(),
            profile: "scraper".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_adaptive_bounds() {
        let spec = StrategySpec::AdaptiveWindow {
            initial: 10,
            min: 20,
            max: 30,
            window_secs: 60,
            adjustment_interval_secs: 60,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_sources() {
        let mut config = Config::default();
        let mut dup = config.sources[0].clone();
        dup.domain = format!("https://www.{}/", dup.domain);
        config.sources.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_webhook_without_url() {
        let mut config = Config::default();
        config.sink.kind = SinkKind::Webhook;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml_with_profiles_and_sources() {
        let toml = r#"
            [scheduler]
            max_concurrent = 5

            [dedup]
            platform_window_mins = 45

            [rate_limit]
            default_profile = "slow"
            patterns = []

            [rate_limit.profiles.slow]
            kind = "sliding_window"
            max_requests = 2
            window_secs = 600

            [rate_limit.profiles.fragile]
            kind = "exponential_backoff"
            base_secs = 5.0
            cap_secs = 600.0
            multiplier = 2.0

            [rate_limit.overrides]
            "pelando.com.br" = "fragile"

            [[sources]]
            domain = "https://www.pelando.com.br"
            category = "deal_aggregator"
            min_poll_interval_secs = 900
            feed_url = "http://localhost:8080/pelando.json"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.scheduler.max_concurrent, 5);
        assert_eq!(config.scheduler.fetch_timeout_secs, 60);
        assert_eq!(config.dedup.platform_window(), Duration::minutes(45));
        assert_eq!(config.dedup.cross_platform_window(), Duration::minutes(15));
        assert_eq!(config.rate_limit.profiles.len(), 2);
        assert!(config.rate_limit.patterns.is_empty());

        let descriptors = config.descriptors().unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].domain, "pelando.com.br");
        assert_eq!(descriptors[0].name, "pelando.com.br");
        assert_eq!(descriptors[0].min_poll_interval, Duration::minutes(15));
    }
}
