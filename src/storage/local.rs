//! Local filesystem snapshot storage.
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous snapshot intact.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::{EngineSnapshot, SnapshotStore};

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    path: PathBuf,
}

/// Just enough of the document to check its version before a full parse.
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl LocalStorage {
    /// Create a LocalStorage writing to the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Read bytes, returning None if the file doesn't exist.
    async fn read_bytes(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

#[async_trait]
impl SnapshotStore for LocalStorage {
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        self.write_bytes(&bytes)
            .await
            .map_err(|e| AppError::persistence(format!("writing {:?}: {e}", self.path)))?;
        log::debug!(
            "Snapshot saved to {:?} ({} sources, {} fingerprints)",
            self.path,
            snapshot.sources.len(),
            snapshot.fingerprints.len()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<EngineSnapshot>> {
        let Some(bytes) = self.read_bytes().await? else {
            return Ok(None);
        };

        let probe: VersionProbe = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::persistence(format!("reading {:?}: {e}", self.path)))?;
        EngineSnapshot::check_version(probe.version)?;

        let snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::persistence(format!("reading {:?}: {e}", self.path)))?;
        Ok(Some(snapshot))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
