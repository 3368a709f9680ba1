//! Snapshot persistence.
//!
//! The engine's durable state (registry entries, dedup fingerprints, rate
//! state and blocks) is saved as one versioned JSON document so a restart
//! honours cadence and limits instead of hammering every source at once.
//!
//! ```text
//! data/
//! └── state.json    # EngineSnapshot, replaced atomically on every save
//! ```

pub mod local;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::SourceDescriptor;
use crate::services::{Fingerprint, FingerprintRecord, RateSnapshot};

// Re-export for convenience
pub use local::LocalStorage;

/// Bumped whenever the document layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub fingerprints: BTreeMap<Fingerprint, FingerprintRecord>,
    #[serde(default)]
    pub rate: RateSnapshot,
}

impl EngineSnapshot {
    pub fn new(
        saved_at: DateTime<Utc>,
        sources: Vec<SourceDescriptor>,
        fingerprints: BTreeMap<Fingerprint, FingerprintRecord>,
        rate: RateSnapshot,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            sources,
            fingerprints,
            rate,
        }
    }

    /// Reject documents written by an incompatible version.
    pub fn check_version(version: u32) -> Result<()> {
        if version == SNAPSHOT_VERSION {
            Ok(())
        } else {
            Err(AppError::persistence(format!(
                "snapshot version {version} is not supported (expected {SNAPSHOT_VERSION})"
            )))
        }
    }
}

/// Trait for snapshot storage backends.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;

    /// Load the stored snapshot, `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<EngineSnapshot>>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}
