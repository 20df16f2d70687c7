//! Incremental re-analysis.
//!
//! The engine compares the stored snapshot's revision and analysis
//! parameters with the current ones, narrows the work to changed paths when
//! that is safe, and folds freshly analyzed files back into the previous
//! report.

pub mod changes;
pub mod snapshot;

pub use changes::{ChangeDetector, ChangeKind, ChangeSet, FileChange, StaticChangeDetector};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, RepositorySnapshot, SnapshotStore};

use crate::config::IncrementalConfig;
use crate::error::SnapshotError;
use crate::models::{AnalysisCandidate, RepositoryIdentity, RepositoryReport};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Produces candidates from a working tree.
pub trait CandidateSource: Send + Sync {
    /// Extract candidates, restricted to `only` when given.
    fn extract(&self, only: Option<&BTreeSet<String>>) -> anyhow::Result<Vec<AnalysisCandidate>>;

    /// Most files a full extraction returns, if capped.
    fn file_limit(&self) -> Option<usize> {
        None
    }
}

impl CandidateSource for Vec<AnalysisCandidate> {
    fn extract(&self, only: Option<&BTreeSet<String>>) -> anyhow::Result<Vec<AnalysisCandidate>> {
        Ok(self
            .iter()
            .filter(|c| only.map_or(true, |paths| paths.contains(&c.file_path)))
            .cloned()
            .collect())
    }
}

/// Outcome of [`IncrementalEngine::decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Paths to re-analyze; `None` when the run must be full.
    pub change_set: Option<ChangeSet>,
    pub force_full: bool,
    /// Revision of the snapshot the change set is relative to.
    pub base_revision: Option<String>,
    pub reason: String,
}

impl Decision {
    pub fn full(reason: impl Into<String>) -> Self {
        Self {
            change_set: None,
            force_full: true,
            base_revision: None,
            reason: reason.into(),
        }
    }
}

pub struct IncrementalEngine {
    store: Arc<dyn SnapshotStore>,
    config: IncrementalConfig,
}

impl IncrementalEngine {
    pub fn new(store: Arc<dyn SnapshotStore>, config: IncrementalConfig) -> Self {
        Self { store, config }
    }

    pub async fn load(
        &self,
        identity: &RepositoryIdentity,
    ) -> Result<Option<RepositorySnapshot>, SnapshotError> {
        self.store.load(identity).await
    }

    /// Decide between a full and an incremental run.
    ///
    /// `parameters` fingerprints the analysis settings; a snapshot taken
    /// under other settings is never extended.
    pub async fn decide(
        &self,
        identity: &RepositoryIdentity,
        current_revision: &str,
        parameters: &str,
        detector: &dyn ChangeDetector,
    ) -> Decision {
        if !self.config.enabled {
            return Decision::full("incremental analysis disabled");
        }

        let snapshot = match self.store.load(identity).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Decision::full("no previous snapshot"),
            Err(e) => {
                warn!("Ignoring snapshot for {}: {}", identity, e);
                return Decision::full(format!("snapshot unusable: {}", e));
            }
        };

        if snapshot.parameters != parameters {
            info!("Analysis parameters for {} changed since the last snapshot", identity);
            return Decision::full("analysis parameters changed");
        }

        if snapshot.revision == current_revision {
            debug!("{} unchanged since {}", identity, current_revision);
            return Decision {
                change_set: Some(ChangeSet::default()),
                force_full: false,
                base_revision: Some(snapshot.revision),
                reason: "revision unchanged".to_string(),
            };
        }

        let changes = match detector.changes(&snapshot.revision, current_revision) {
            Ok(changes) => ChangeSet::from_changes(changes),
            Err(e) => {
                warn!("Cannot diff {}..{}: {}", snapshot.revision, current_revision, e);
                return Decision::full(format!("change detection failed: {}", e));
            }
        };

        if changes.len() > self.config.max_changed_files {
            info!(
                changed = changes.len(),
                limit = self.config.max_changed_files,
                "Too many changes for incremental analysis"
            );
            return Decision::full(format!(
                "{} changed files exceed the limit of {}",
                changes.len(),
                self.config.max_changed_files
            ));
        }

        Decision {
            reason: format!("{} changed file(s) since {}", changes.len(), snapshot.revision),
            change_set: Some(changes),
            force_full: false,
            base_revision: Some(snapshot.revision),
        }
    }

    /// Candidates for the changed, non-deleted paths.
    pub fn candidates_for(
        &self,
        change_set: &ChangeSet,
        source: &dyn CandidateSource,
    ) -> anyhow::Result<Vec<AnalysisCandidate>> {
        let paths = change_set.paths_to_analyze();
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        source.extract(Some(&paths))
    }

    /// Fold a partial report into the previous one.
    ///
    /// Changed paths take their entry from `partial` or disappear when it has
    /// none; all other entries are kept as they were.
    pub fn merge(
        previous: &RepositoryReport,
        partial: &RepositoryReport,
        change_set: &ChangeSet,
    ) -> RepositoryReport {
        if change_set.is_empty() {
            return previous.clone();
        }

        let mut files = previous.files.clone();
        for (path, kind) in change_set.iter() {
            match (kind, partial.files.get(path)) {
                (ChangeKind::Deleted, _) | (_, None) => {
                    files.remove(path);
                }
                (_, Some(fresh)) => {
                    files.insert(path.to_string(), fresh.clone());
                }
            }
        }

        RepositoryReport::new(
            partial.repository.clone(),
            partial.revision.clone(),
            partial.analyzed_at,
            files,
        )
    }

    /// Replace the identity's snapshot.
    pub async fn snapshot(
        &self,
        identity: &RepositoryIdentity,
        revision: &str,
        parameters: &str,
        report: &RepositoryReport,
    ) -> Result<RepositorySnapshot, SnapshotError> {
        let snapshot = RepositorySnapshot {
            identity: identity.clone(),
            revision: revision.to_string(),
            parameters: parameters.to_string(),
            report: report.clone(),
            created_at: Utc::now(),
        };
        self.store.save(&snapshot).await?;
        info!("Snapshot of {} stored at {}", identity, revision);
        Ok(snapshot)
    }
}
