//! Stub collaborators shared by unit tests.

use crate::error::ProviderError;
use crate::models::{
    AnalysisCandidate, AnalysisOutput, BackendKind, ProviderDescriptor, SkillLevel,
};
use crate::providers::{ProviderAdapter, ProviderOutcome};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Scriptable provider that counts its calls.
pub struct StubProvider {
    pub id: String,
    pub confidence: f64,
    pub output: AnalysisOutput,
    pub delay: Option<Duration>,
    pub error: Option<ProviderError>,
    pub cost_per_1k_tokens: f64,
    pub tokens_used: u64,
    pub weight: f64,
    pub reachable: AtomicBool,
    calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(id: &str, confidence: f64) -> Self {
        Self {
            id: id.to_string(),
            confidence,
            output: AnalysisOutput {
                patterns: vec![format!("{}_pattern", id)],
                findings: Vec::new(),
                complexity_score: 5.0,
                skill_level: SkillLevel::Intermediate,
                suggestions: Vec::new(),
            },
            delay: None,
            error: None,
            cost_per_1k_tokens: 0.0,
            tokens_used: 1000,
            weight: 1.0,
            reachable: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_output(mut self, output: AnalysisOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_complexity(mut self, score: f64) -> Self {
        self.output.complexity_score = score;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    pub fn failing(mut self, error: ProviderError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for StubProvider {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: self.id.clone(),
            backend: BackendKind::LocalModel,
            model: self.id.clone(),
            cost_per_1k_tokens: self.cost_per_1k_tokens,
            context_window: 8192,
            weight: self.weight,
            available: self.reachable.load(Ordering::SeqCst),
        }
    }

    async fn is_available(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn analyze(
        &self,
        _candidate: &AnalysisCandidate,
        _kind: crate::models::AnalysisKind,
    ) -> Result<ProviderOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        Ok(ProviderOutcome {
            output: self.output.clone(),
            confidence: self.confidence,
            tokens_used: self.tokens_used,
        })
    }
}

/// A candidate at a fixed commit.
pub fn candidate(path: &str, content: &str) -> AnalysisCandidate {
    let language = if path.ends_with(".py") { "Python" } else { "Rust" };
    let timestamp = Utc
        .timestamp_opt(1_700_000_000, 0)
        .single()
        .unwrap_or_else(Utc::now);
    AnalysisCandidate::new(content, language, path, "c0ffee", timestamp)
}

/// Stage every file in the working tree, including deletions, and commit.
pub fn commit_all(repo: &git2::Repository, message: &str) -> git2::Oid {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.update_all(["*"].iter(), None).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("Test", "test@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}
