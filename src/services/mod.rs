//! Engine services.
//!
//! This module contains the shared state the scheduler works against:
//! - Source registry (`SourceRegistry`)
//! - Duplicate suppression (`DedupIndex`)
//! - Admission control (`RateController`)
//! - Single-flight lookup cache (`TtlCache`)

mod cache;
mod dedup;
pub mod rate_limit;
mod registry;

pub use cache::{CacheStats, TtlCache};
pub use dedup::{DedupIndex, DedupStats, Fingerprint, FingerprintRecord};
pub use rate_limit::{Admission, BlockEntry, DomainStatus, RateController, RateSnapshot, RateStats};
pub use registry::{SourceRegistry, SyncReport, priority_score};
