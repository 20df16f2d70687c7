//! Analysis coordinator.
//!
//! Sequences the cache, the ensemble and the incremental engine. A single
//! candidate goes cache → providers → cache; a repository run decides
//! between full and incremental analysis, analyzes the candidates with
//! bounded concurrency, and stores the resulting snapshot.

use crate::cache::{
    cache_key, fingerprint, kind_tag, language_tag, provider_tag, AnalysisCache, KeyParams,
};
use crate::config::AnalysisConfig;
use crate::ensemble::EnsembleOrchestrator;
use crate::error::{AnalysisError, AnalysisResult};
use crate::incremental::{
    CandidateSource, ChangeDetector, ChangeSet, Decision, IncrementalEngine,
};
use crate::models::{
    AnalysisCandidate, AnalysisKind, AnalysisResponse, CachedAnalysis, ConsensusMethod, FileReport,
    RepositoryIdentity, RepositoryReport,
};
use crate::sync::KeyedLocks;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a repository run was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Full,
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Result of [`AnalysisCoordinator::analyze_repository`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRun {
    pub report: RepositoryReport,
    pub mode: RunMode,
    pub reason: String,
    /// Files analyzed in this run.
    pub analyzed_files: usize,
    /// Files carried over from the previous snapshot.
    pub reused_files: usize,
    /// Files dropped from the previous snapshot.
    pub removed_files: usize,
}

/// Outcome of an attempted incremental run.
enum Incremental {
    Done(RepositoryRun),
    /// Fall back to a full run for this reason.
    Abandoned(String),
}

pub struct AnalysisCoordinator {
    ensemble: Arc<EnsembleOrchestrator>,
    cache: Arc<AnalysisCache>,
    engine: Arc<IncrementalEngine>,
    config: AnalysisConfig,
    method: ConsensusMethod,
    pinned_provider: Option<String>,
    force_full: bool,
    persist_snapshots: bool,
    key_locks: KeyedLocks,
    repo_locks: KeyedLocks,
    progress: Option<ProgressBar>,
}

impl AnalysisCoordinator {
    pub fn new(
        ensemble: Arc<EnsembleOrchestrator>,
        cache: Arc<AnalysisCache>,
        engine: Arc<IncrementalEngine>,
        config: AnalysisConfig,
    ) -> Self {
        let method = ensemble.config().method;
        Self {
            ensemble,
            cache,
            engine,
            config,
            method,
            pinned_provider: None,
            force_full: false,
            persist_snapshots: true,
            key_locks: KeyedLocks::new(),
            repo_locks: KeyedLocks::new(),
            progress: None,
        }
    }

    pub fn with_method(mut self, method: ConsensusMethod) -> Self {
        self.method = method;
        self
    }

    /// Route repository runs through one provider instead of the ensemble.
    pub fn with_pinned_provider(mut self, provider_id: Option<String>) -> Self {
        self.pinned_provider = provider_id;
        self
    }

    /// Ignore stored snapshots (a new one is still written).
    pub fn with_forced_full(mut self, force_full: bool) -> Self {
        self.force_full = force_full;
        self
    }

    /// Whether runs replace the stored snapshot. Runs over uncommitted
    /// content turn this off so the snapshot stays tied to a commit.
    pub fn with_snapshot_persistence(mut self, persist: bool) -> Self {
        self.persist_snapshots = persist;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    pub fn ensemble(&self) -> &EnsembleOrchestrator {
        &self.ensemble
    }

    /// Fingerprint of every setting besides file content that shapes a
    /// repository report.
    pub fn parameters_fingerprint(&self) -> String {
        let provider_ids = self.ensemble.provider_ids();
        let params = fingerprint(&KeyParams {
            method: self.method,
            pinned_provider: self.pinned_provider.as_deref(),
            provider_ids: &provider_ids,
        });
        let mut kinds: Vec<String> = self.config.kinds.iter().map(|k| k.to_string()).collect();
        kinds.sort();
        kinds.dedup();
        format!("{}:{}", params, kinds.join(","))
    }

    /// How a repository run at `revision` would proceed.
    pub async fn plan(
        &self,
        identity: &RepositoryIdentity,
        revision: &str,
        detector: &dyn ChangeDetector,
    ) -> Decision {
        if self.force_full {
            return Decision::full("full analysis requested");
        }
        self.engine
            .decide(identity, revision, &self.parameters_fingerprint(), detector)
            .await
    }

    /// Analyze one candidate for one kind, consulting the cache first.
    pub async fn analyze(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
        pinned: Option<&str>,
    ) -> AnalysisResult<AnalysisResponse> {
        if candidate.content.trim().is_empty() {
            return Err(AnalysisError::EmptyCandidate(candidate.file_path.clone()));
        }
        if let Some(id) = pinned {
            if !self.ensemble.knows(id) {
                return Err(AnalysisError::UnknownProvider(id.to_string()));
            }
        }

        let provider_ids = self.ensemble.provider_ids();
        let key = cache_key(
            candidate,
            kind,
            &KeyParams {
                method: self.method,
                pinned_provider: pinned,
                provider_ids: &provider_ids,
            },
        );

        let _flight = self.key_locks.lock(&key).await;

        if let Some(cached) = self.cache.get(&key).await {
            debug!(file = %candidate.file_path, kind = %kind, "Served from cache");
            return Ok(AnalysisResponse::from_cached(kind, cached));
        }

        let value = match pinned {
            Some(id) => CachedAnalysis::Single(
                self.ensemble.analyze_with_provider(id, candidate, kind).await?,
            ),
            None => CachedAnalysis::Consensus(
                self.ensemble
                    .analyze_with_ensemble(candidate, kind, self.method)
                    .await,
            ),
        };

        let (providers, fallback_only) = match &value {
            CachedAnalysis::Consensus(c) => (c.providers.clone(), c.fallback_used),
            CachedAnalysis::Single(r) => (
                vec![r.provider_id.clone()],
                pinned.map_or(false, |id| id != r.provider_id),
            ),
        };

        // Fallback answers are not cached while model providers exist.
        if fallback_only && !provider_ids.is_empty() {
            debug!(file = %candidate.file_path, kind = %kind, "Not caching fallback result");
        } else {
            let mut tags = vec![kind_tag(kind), language_tag(&candidate.language)];
            tags.extend(providers.iter().map(|p| provider_tag(p)));
            self.cache.set(&key, &value, kind, &tags).await;
        }

        Ok(AnalysisResponse::from_cached(kind, value))
    }

    /// Analyze a repository at `revision`, incrementally when possible.
    pub async fn analyze_repository(
        &self,
        identity: &RepositoryIdentity,
        revision: &str,
        source: &dyn CandidateSource,
        detector: &dyn ChangeDetector,
    ) -> AnalysisResult<RepositoryRun> {
        if let Some(id) = self.pinned_provider.as_deref() {
            if !self.ensemble.knows(id) {
                return Err(AnalysisError::UnknownProvider(id.to_string()));
            }
        }

        let _repo = self.repo_locks.lock(identity.as_str()).await;

        let decision = self.plan(identity, revision, detector).await;
        let reason = match (decision.change_set, decision.base_revision) {
            (Some(change_set), Some(base)) if !decision.force_full => {
                info!("Incremental run for {}: {}", identity, decision.reason);
                match self
                    .run_incremental(identity, revision, &base, &change_set, source)
                    .await?
                {
                    Incremental::Done(run) => return Ok(run),
                    Incremental::Abandoned(reason) => reason,
                }
            }
            _ => decision.reason,
        };

        info!("Full run for {}: {}", identity, reason);
        self.run_full(identity, revision, source, reason).await
    }

    async fn run_full(
        &self,
        identity: &RepositoryIdentity,
        revision: &str,
        source: &dyn CandidateSource,
        reason: String,
    ) -> AnalysisResult<RepositoryRun> {
        let candidates = source.extract(None).map_err(AnalysisError::Extraction)?;
        let files = self.analyze_candidates(candidates).await?;
        let analyzed_files = files.len();
        let report = RepositoryReport::new(identity.clone(), revision, Utc::now(), files);

        self.store_snapshot(identity, revision, &report).await;

        Ok(RepositoryRun {
            report,
            mode: RunMode::Full,
            reason,
            analyzed_files,
            reused_files: 0,
            removed_files: 0,
        })
    }

    /// Abandoned when the snapshot moved away from `base` or the merged
    /// report outgrows the source's file cap.
    async fn run_incremental(
        &self,
        identity: &RepositoryIdentity,
        revision: &str,
        base: &str,
        change_set: &ChangeSet,
        source: &dyn CandidateSource,
    ) -> AnalysisResult<Incremental> {
        let candidates = self
            .engine
            .candidates_for(change_set, source)
            .map_err(AnalysisError::Extraction)?;
        let files = self.analyze_candidates(candidates).await?;
        let analyzed_files = files.len();
        let partial = RepositoryReport::new(identity.clone(), revision, Utc::now(), files);

        let parameters = self.parameters_fingerprint();
        let moved = || format!("snapshot for {} moved away from {}", identity, base);
        let previous = match self.engine.load(identity).await {
            Ok(Some(snapshot))
                if snapshot.revision == base && snapshot.parameters == parameters =>
            {
                snapshot.report
            }
            Ok(Some(snapshot)) => {
                warn!(
                    "Snapshot for {} was replaced (now at {}, expected {}); re-running in full",
                    identity, snapshot.revision, base
                );
                return Ok(Incremental::Abandoned(moved()));
            }
            Ok(None) => {
                warn!("Snapshot for {} disappeared; re-running in full", identity);
                return Ok(Incremental::Abandoned(moved()));
            }
            Err(e) => {
                warn!("Snapshot for {} unreadable ({}); re-running in full", identity, e);
                return Ok(Incremental::Abandoned(moved()));
            }
        };

        let mut report = IncrementalEngine::merge(&previous, &partial, change_set);
        if report.revision != revision {
            report.revision = revision.to_string();
        }
        if let Some(limit) = source.file_limit() {
            if report.files.len() > limit {
                info!(files = report.files.len(), limit, "Merged report exceeds the file cap");
                return Ok(Incremental::Abandoned(format!(
                    "{} files exceed the cap of {}",
                    report.files.len(),
                    limit
                )));
            }
        }

        let removed_files = previous
            .files
            .keys()
            .filter(|path| !report.files.contains_key(*path))
            .count();
        let reused_files = report
            .files
            .keys()
            .filter(|path| !change_set.contains(path))
            .count();

        self.store_snapshot(identity, revision, &report).await;

        Ok(Incremental::Done(RepositoryRun {
            mode: RunMode::Incremental,
            reason: format!("{} changed file(s) since {}", change_set.len(), base),
            analyzed_files,
            reused_files,
            removed_files,
            report,
        }))
    }

    async fn store_snapshot(
        &self,
        identity: &RepositoryIdentity,
        revision: &str,
        report: &RepositoryReport,
    ) {
        if !self.persist_snapshots {
            debug!("Not storing a snapshot for {} at {}", identity, revision);
            return;
        }
        let parameters = self.parameters_fingerprint();
        if let Err(e) = self.engine.snapshot(identity, revision, &parameters, report).await {
            warn!("Failed to store snapshot for {}: {}", identity, e);
        }
    }

    async fn analyze_candidates(
        &self,
        candidates: Vec<AnalysisCandidate>,
    ) -> AnalysisResult<BTreeMap<String, FileReport>> {
        if let Some(pb) = &self.progress {
            pb.set_length(candidates.len() as u64);
        }

        let reports: Vec<AnalysisResult<Option<FileReport>>> = stream::iter(candidates)
            .map(|candidate| async move {
                let result = self.analyze_file(&candidate).await;
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                    pb.set_message(candidate.file_path.clone());
                }
                result
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut files = BTreeMap::new();
        for report in reports {
            if let Some(report) = report? {
                files.insert(report.path.clone(), report);
            }
        }
        Ok(files)
    }

    async fn analyze_file(
        &self,
        candidate: &AnalysisCandidate,
    ) -> AnalysisResult<Option<FileReport>> {
        if candidate.content.trim().is_empty() {
            debug!("Skipping empty file {}", candidate.file_path);
            return Ok(None);
        }

        let mut analyses = BTreeMap::new();
        for &kind in &self.config.kinds {
            let response = self
                .analyze(candidate, kind, self.pinned_provider.as_deref())
                .await?;
            analyses.insert(kind, response);
        }

        Ok(Some(FileReport {
            path: candidate.file_path.clone(),
            language: candidate.language.clone(),
            line_count: candidate.line_count(),
            content_digest: candidate.content_digest(),
            analyses,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, EnsembleConfig, IncrementalConfig};
    use crate::error::{ProviderError, SnapshotError};
    use crate::incremental::{
        ChangeKind, FileChange, MemorySnapshotStore, RepositorySnapshot, SnapshotStore,
        StaticChangeDetector,
    };
    use crate::providers::ProviderAdapter;
    use crate::test_support::{candidate, StubProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn identity() -> RepositoryIdentity {
        RepositoryIdentity::from_remote("https://github.com/acme/app")
    }

    fn coordinator_with(
        stubs: &[Arc<StubProvider>],
        store: Arc<dyn SnapshotStore>,
    ) -> AnalysisCoordinator {
        let providers = stubs
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ProviderAdapter>)
            .collect();
        let ensemble = EnsembleOrchestrator::new(
            providers,
            EnsembleConfig {
                timeout_seconds: 2.0,
                ..EnsembleConfig::default()
            },
        );
        let cache = AnalysisCache::memory_only(&CacheConfig::default());
        let engine = IncrementalEngine::new(store, IncrementalConfig::default());
        AnalysisCoordinator::new(
            Arc::new(ensemble),
            Arc::new(cache),
            Arc::new(engine),
            AnalysisConfig {
                kinds: vec![AnalysisKind::Quality],
                concurrency: 2,
            },
        )
    }

    fn two_stubs() -> (Arc<StubProvider>, Arc<StubProvider>) {
        (
            Arc::new(StubProvider::new("a", 0.9)),
            Arc::new(StubProvider::new("b", 0.6)),
        )
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let (a, b) = two_stubs();
        let coordinator =
            coordinator_with(&[a.clone(), b.clone()], Arc::new(MemorySnapshotStore::new()));
        let c = candidate("src/a.py", "def f():\n    return 1\n");

        let first = coordinator.analyze(&c, AnalysisKind::Quality, None).await.unwrap();
        let second = coordinator.analyze(&c, AnalysisKind::Quality, None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        let metadata = first.ensemble_metadata.unwrap();
        assert_eq!(metadata.models_used, vec!["a", "b"]);
        assert!(first.ai_powered);

        // Same text at another path shares the entry.
        let moved = candidate("lib/moved.py", "def f():\n    return 1\n");
        coordinator.analyze(&moved, AnalysisKind::Quality, None).await.unwrap();
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_dispatch() {
        let slow = Arc::new(StubProvider::new("slow", 0.9).with_delay(Duration::from_millis(50)));
        let coordinator = coordinator_with(&[slow.clone()], Arc::new(MemorySnapshotStore::new()));
        let c = candidate("a.rs", "fn main() {}");

        let (x, y) = tokio::join!(
            coordinator.analyze(&c, AnalysisKind::Quality, None),
            coordinator.analyze(&c, AnalysisKind::Quality, None),
        );
        assert_eq!(x.unwrap(), y.unwrap());
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidated_entries_are_recomputed() {
        let (a, b) = two_stubs();
        let coordinator = coordinator_with(&[a.clone(), b], Arc::new(MemorySnapshotStore::new()));
        let c = candidate("a.py", "x = 1\n");

        coordinator.analyze(&c, AnalysisKind::Quality, None).await.unwrap();
        assert_eq!(coordinator.cache().invalidate("provider:a").await, 1);
        coordinator.analyze(&c, AnalysisKind::Quality, None).await.unwrap();
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_results_are_not_cached() {
        let down = Arc::new(
            StubProvider::new("down", 0.9)
                .failing(ProviderError::Backend("HTTP 503".to_string())),
        );
        let coordinator = coordinator_with(&[down.clone()], Arc::new(MemorySnapshotStore::new()));
        let c = candidate("a.py", "x = 1\n");

        let first = coordinator.analyze(&c, AnalysisKind::Security, None).await.unwrap();
        assert!(!first.ai_powered);
        // Let the background recheck finish; the stub still answers availability checks.
        tokio::task::yield_now().await;
        coordinator.analyze(&c, AnalysisKind::Security, None).await.unwrap();
        assert_eq!(down.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_errors() {
        let (a, b) = two_stubs();
        let coordinator = coordinator_with(&[a, b], Arc::new(MemorySnapshotStore::new()));

        let err = coordinator
            .analyze(&candidate("a.py", "   \n"), AnalysisKind::Quality, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyCandidate(p) if p == "a.py"));

        let err = coordinator
            .analyze(&candidate("a.py", "x = 1"), AnalysisKind::Quality, Some("gpt-9"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn test_pinned_provider_result() {
        let (a, b) = two_stubs();
        let coordinator =
            coordinator_with(&[a.clone(), b.clone()], Arc::new(MemorySnapshotStore::new()));

        let response = coordinator
            .analyze(&candidate("a.py", "x = 1"), AnalysisKind::Pattern, Some("b"))
            .await
            .unwrap();
        assert_eq!(response.providers, vec!["b"]);
        assert!(response.ensemble_metadata.is_none());
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_repository_runs_full_then_incremental() {
        let (a, b) = two_stubs();
        let coordinator = coordinator_with(&[a.clone(), b], Arc::new(MemorySnapshotStore::new()));
        let r1 = vec![
            candidate("a.py", "def a():\n    return 1\n"),
            candidate("b.py", "def b():\n    return 2\n"),
        ];

        let first = coordinator
            .analyze_repository(&identity(), "r1", &r1, &StaticChangeDetector::default())
            .await
            .unwrap();
        assert_eq!(first.mode, RunMode::Full);
        assert_eq!(first.analyzed_files, 2);
        assert_eq!(a.calls(), 2);

        let r2 = vec![
            candidate("a.py", "def a():\n    return 1\n"),
            candidate("b.py", "def b():\n    return 3\n"),
        ];
        let detector =
            StaticChangeDetector::new(vec![FileChange::new("b.py", ChangeKind::Modified)]);
        let second = coordinator
            .analyze_repository(&identity(), "r2", &r2, &detector)
            .await
            .unwrap();

        assert_eq!(second.mode, RunMode::Incremental);
        assert_eq!(second.analyzed_files, 1);
        assert_eq!(second.reused_files, 1);
        assert_eq!(second.report.revision, "r2");
        assert_eq!(a.calls(), 3);
        assert_eq!(
            serde_json::to_string(&second.report.files["a.py"]).unwrap(),
            serde_json::to_string(&first.report.files["a.py"]).unwrap()
        );
        assert_ne!(
            second.report.files["b.py"].content_digest,
            first.report.files["b.py"].content_digest
        );
    }

    #[tokio::test]
    async fn test_unchanged_revision_makes_no_calls() {
        let (a, b) = two_stubs();
        let coordinator = coordinator_with(&[a.clone(), b], Arc::new(MemorySnapshotStore::new()));
        let source = vec![candidate("a.py", "x = 1\n")];
        let detector = StaticChangeDetector::default();

        let first = coordinator
            .analyze_repository(&identity(), "r1", &source, &detector)
            .await
            .unwrap();
        let again = coordinator
            .analyze_repository(&identity(), "r1", &source, &detector)
            .await
            .unwrap();

        assert_eq!(again.mode, RunMode::Incremental);
        assert_eq!(again.analyzed_files, 0);
        assert_eq!(again.report.files, first.report.files);
        assert_eq!(a.calls(), 1);
    }

    /// Reports the base revision once, then a revision written by someone else.
    struct MovingStore {
        inner: MemorySnapshotStore,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotStore for MovingStore {
        async fn load(
            &self,
            identity: &RepositoryIdentity,
        ) -> Result<Option<RepositorySnapshot>, SnapshotError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            let snapshot = self.inner.load(identity).await?;
            Ok(snapshot.map(|mut s| {
                if n > 0 {
                    s.revision = "elsewhere".to_string();
                }
                s
            }))
        }

        async fn save(&self, snapshot: &RepositorySnapshot) -> Result<(), SnapshotError> {
            self.inner.save(snapshot).await
        }
    }

    #[tokio::test]
    async fn test_moved_snapshot_forces_full_run() {
        let store = Arc::new(MovingStore {
            inner: MemorySnapshotStore::new(),
            loads: AtomicUsize::new(0),
        });
        let (a, b) = two_stubs();
        let coordinator = coordinator_with(&[a, b], store.clone());

        let base = candidate("a.py", "x = 1\n");
        let report = RepositoryReport::new(identity(), "r1", Utc::now(), BTreeMap::new());
        store
            .inner
            .save(&RepositorySnapshot {
                identity: identity(),
                revision: "r1".to_string(),
                parameters: coordinator.parameters_fingerprint(),
                report,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let detector = StaticChangeDetector::new(vec![FileChange::new("a.py", ChangeKind::Added)]);
        let run = coordinator
            .analyze_repository(&identity(), "r2", &vec![base], &detector)
            .await
            .unwrap();

        assert_eq!(run.mode, RunMode::Full);
        assert!(run.reason.contains("moved"));
        assert_eq!(run.report.files.len(), 1);
    }

    #[tokio::test]
    async fn test_new_kinds_at_same_revision_rerun_in_full() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let source = vec![candidate("a.py", "API_KEY = \"sk-live-1234567890\"\n")];
        let detector = StaticChangeDetector::failing("same revision");

        let (a, b) = two_stubs();
        let quality_only = coordinator_with(&[a.clone(), b.clone()], store.clone());
        quality_only
            .analyze_repository(&identity(), "r1", &source, &detector)
            .await
            .unwrap();

        let mut widened = coordinator_with(&[a, b], store);
        widened.config.kinds = vec![AnalysisKind::Quality, AnalysisKind::Security];
        assert_ne!(widened.parameters_fingerprint(), quality_only.parameters_fingerprint());

        let run = widened
            .analyze_repository(&identity(), "r1", &source, &detector)
            .await
            .unwrap();
        assert_eq!(run.mode, RunMode::Full);
        assert!(run.reason.contains("parameters"));
        let analyses = &run.report.files["a.py"].analyses;
        assert!(analyses.contains_key(&AnalysisKind::Security));
        assert!(analyses.contains_key(&AnalysisKind::Quality));

        // Same settings again: nothing to redo.
        let again = widened
            .analyze_repository(&identity(), "r1", &source, &detector)
            .await
            .unwrap();
        assert_eq!(again.mode, RunMode::Incremental);
    }

    #[tokio::test]
    async fn test_changed_method_is_a_new_parameter_set() {
        let (a, b) = two_stubs();
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let confidence = coordinator_with(&[a.clone(), b.clone()], store.clone());
        let majority = coordinator_with(&[a, b], store).with_method(ConsensusMethod::MajorityVote);
        assert_ne!(confidence.parameters_fingerprint(), majority.parameters_fingerprint());

        let (c, d) = two_stubs();
        let pinned = coordinator_with(&[c, d], Arc::new(MemorySnapshotStore::new()))
            .with_pinned_provider(Some("a".to_string()));
        assert_ne!(confidence.parameters_fingerprint(), pinned.parameters_fingerprint());
    }

    #[tokio::test]
    async fn test_unpersisted_run_leaves_snapshot_alone() {
        let (a, b) = two_stubs();
        let store = Arc::new(MemorySnapshotStore::new());
        let clean = vec![candidate("a.py", "x = 1\n")];
        let detector = StaticChangeDetector::failing("same revision");

        let committed = coordinator_with(&[a.clone(), b.clone()], store.clone());
        committed
            .analyze_repository(&identity(), "h1", &clean, &detector)
            .await
            .unwrap();

        // Uncommitted edits: analyzed in full, snapshot untouched.
        let dirty = vec![candidate("a.py", "API_KEY = \"sk-live-1234567890\"\n")];
        let scratch = coordinator_with(&[a.clone(), b.clone()], store.clone())
            .with_forced_full(true)
            .with_snapshot_persistence(false);
        let run = scratch
            .analyze_repository(&identity(), "h1+dirty", &dirty, &detector)
            .await
            .unwrap();
        assert_eq!(run.mode, RunMode::Full);
        assert_eq!(run.report.revision, "h1+dirty");

        let stored = store.load(&identity()).await.unwrap().unwrap();
        assert_eq!(stored.revision, "h1");
        assert_eq!(
            stored.report.files["a.py"].content_digest,
            clean[0].content_digest()
        );
    }

    /// Candidates with a full-scan cap, like a capped working tree.
    struct Capped {
        files: Vec<AnalysisCandidate>,
        limit: usize,
    }

    impl CandidateSource for Capped {
        fn extract(
            &self,
            only: Option<&std::collections::BTreeSet<String>>,
        ) -> anyhow::Result<Vec<AnalysisCandidate>> {
            let all = self.files.extract(only)?;
            Ok(match only {
                Some(_) => all,
                None => all.into_iter().take(self.limit).collect(),
            })
        }

        fn file_limit(&self) -> Option<usize> {
            Some(self.limit)
        }
    }

    #[tokio::test]
    async fn test_incremental_run_respects_file_cap() {
        let (a, b) = two_stubs();
        let coordinator = coordinator_with(&[a, b], Arc::new(MemorySnapshotStore::new()));
        let r1 = Capped {
            files: vec![candidate("a.py", "x = 1\n"), candidate("b.py", "y = 2\n")],
            limit: 2,
        };
        coordinator
            .analyze_repository(&identity(), "r1", &r1, &StaticChangeDetector::default())
            .await
            .unwrap();

        let r2 = Capped {
            files: vec![
                candidate("a.py", "x = 1\n"),
                candidate("b.py", "y = 2\n"),
                candidate("c.py", "z = 3\n"),
            ],
            limit: 2,
        };
        let detector = StaticChangeDetector::new(vec![FileChange::new("c.py", ChangeKind::Added)]);
        let run = coordinator
            .analyze_repository(&identity(), "r2", &r2, &detector)
            .await
            .unwrap();

        assert_eq!(run.mode, RunMode::Full);
        assert!(run.reason.contains("cap"));
        assert_eq!(run.report.files.len(), 2);
    }
}
