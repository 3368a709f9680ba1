// src/models/mod.rs

//! Domain models for the deal engine.
//!
//! Sources and their scheduling metadata, the candidate items adapters
//! produce, per-attempt outcomes, and configuration.

mod config;
mod item;
mod outcome;
mod source;

// Re-export all public types
pub use config::{
    CacheConfig, Config, DedupConfig, HttpConfig, LoggingConfig, PatternBinding,
    RateLimitConfig, SchedulerConfig, SinkConfig, SinkKind, SourceConfig, StorageConfig,
    StrategySpec,
};
pub use item::CandidateItem;
pub use outcome::{CycleReport, ScrapeOutcome};
pub use source::{SourceCategory, SourceDescriptor};
