//! Snapshot persistence.
//!
//! A snapshot is the last report for a repository, the revision it was
//! computed against and a fingerprint of the analysis parameters that shaped
//! it. There is at most one per [`RepositoryIdentity`]; saving replaces it.

use crate::error::SnapshotError;
use crate::models::{RepositoryIdentity, RepositoryReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub identity: RepositoryIdentity,
    pub revision: String,
    /// Kinds, consensus method, pinned provider and prompt version in use.
    /// Snapshots written without one never match.
    #[serde(default)]
    pub parameters: String,
    pub report: RepositoryReport,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(
        &self,
        identity: &RepositoryIdentity,
    ) -> Result<Option<RepositorySnapshot>, SnapshotError>;

    async fn save(&self, snapshot: &RepositorySnapshot) -> Result<(), SnapshotError>;
}

/// Process-local snapshots.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<RepositoryIdentity, RepositorySnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(
        &self,
        identity: &RepositoryIdentity,
    ) -> Result<Option<RepositorySnapshot>, SnapshotError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|p| p.into_inner());
        Ok(snapshots.get(identity).cloned())
    }

    async fn save(&self, snapshot: &RepositorySnapshot) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|p| p.into_inner());
        snapshots.insert(snapshot.identity.clone(), snapshot.clone());
        Ok(())
    }
}

/// One JSON file per repository, named by the hash of its identity.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identity: &RepositoryIdentity) -> PathBuf {
        let digest = hex::encode(Sha256::digest(identity.as_str().as_bytes()));
        self.dir.join(format!("{}.json", digest))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(
        &self,
        identity: &RepositoryIdentity,
    ) -> Result<Option<RepositorySnapshot>, SnapshotError> {
        let path = self.path_for(identity);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: RepositorySnapshot =
            serde_json::from_str(&raw).map_err(|e| SnapshotError::Corrupt {
                identity: identity.to_string(),
                reason: e.to_string(),
            })?;

        if &snapshot.identity != identity {
            return Err(SnapshotError::Corrupt {
                identity: identity.to_string(),
                reason: format!("file belongs to {}", snapshot.identity),
            });
        }
        debug!("Loaded snapshot for {} at {}", identity, snapshot.revision);
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &RepositorySnapshot) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&snapshot.identity);
        let tmp = path.with_extension("json.tmp");

        let raw = serde_json::to_string_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved snapshot for {} to {}", snapshot.identity, path.display());
        Ok(())
    }
}
