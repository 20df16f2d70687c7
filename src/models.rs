//! Data models for the analysis core.
//!
//! This module contains the candidate, provider, result and report
//! structures shared by the providers, the ensemble, the cache and the
//! incremental engine.

use crate::error::AnalysisError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// The fixed set of analyses a provider can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    /// Design and idiom pattern detection
    Pattern,
    /// Code quality and maintainability
    Quality,
    /// Security vulnerabilities
    Security,
    /// Performance problems
    Performance,
}

impl AnalysisKind {
    /// All kinds, in report order.
    pub const ALL: [AnalysisKind; 4] = [
        AnalysisKind::Pattern,
        AnalysisKind::Quality,
        AnalysisKind::Security,
        AnalysisKind::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Pattern => "pattern",
            AnalysisKind::Quality => "quality",
            AnalysisKind::Security => "security",
            AnalysisKind::Performance => "performance",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisKind {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pattern" | "patterns" => Ok(AnalysisKind::Pattern),
            "quality" => Ok(AnalysisKind::Quality),
            "security" => Ok(AnalysisKind::Security),
            "performance" => Ok(AnalysisKind::Performance),
            other => Err(AnalysisError::UnsupportedKind(other.to_string())),
        }
    }
}

/// A unit of source text submitted for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCandidate {
    /// Source text.
    pub content: String,
    /// Language tag (e.g. "Rust", "Python").
    pub language: String,
    /// Path relative to the repository root.
    pub file_path: String,
    /// Commit the text was extracted from.
    pub commit_id: String,
    /// Timestamp of that commit.
    pub commit_timestamp: DateTime<Utc>,
}

impl AnalysisCandidate {
    pub fn new(
        content: impl Into<String>,
        language: impl Into<String>,
        file_path: impl Into<String>,
        commit_id: impl Into<String>,
        commit_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            content: content.into(),
            language: language.into(),
            file_path: file_path.into(),
            commit_id: commit_id.into(),
            commit_timestamp,
        }
    }

    /// SHA-256 of the source text, hex encoded.
    pub fn content_digest(&self) -> String {
        hex::encode(Sha256::digest(self.content.as_bytes()))
    }

    pub fn line_count(&self) -> usize {
        self.content.lines().count()
    }

    /// Rough token estimate (4 bytes per token).
    pub fn approx_tokens(&self) -> usize {
        self.content.len().div_ceil(4)
    }
}

/// Kind of backend behind a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Model served locally (no cost, may be slow to warm up)
    LocalModel,
    /// Metered remote API
    RemoteApi,
    /// Deterministic rule table
    RuleBased,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::LocalModel => write!(f, "local"),
            BackendKind::RemoteApi => write!(f, "remote"),
            BackendKind::RuleBased => write!(f, "rules"),
        }
    }
}

/// Static description of a provider plus its current availability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Unique provider identifier.
    pub id: String,
    /// Backend kind.
    pub backend: BackendKind,
    /// Model name served by the backend.
    pub model: String,
    /// Declared cost in USD per 1000 tokens.
    pub cost_per_1k_tokens: f64,
    /// Context window in tokens.
    pub context_window: usize,
    /// Static trust weight used by `weighted_average` consensus.
    pub weight: f64,
    /// Last known availability.
    pub available: bool,
}

/// Severity level of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Low severity - style issues, minor suggestions
    Low,
    /// Medium severity - code quality issues, potential bugs
    Medium,
    /// High severity - bugs, security concerns
    High,
    /// Critical severity - security vulnerabilities, major bugs
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl Severity {
    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "🟢",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }

    /// Lenient parse used for model output; unknown values map to Medium.
    pub fn from_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "low" | "info" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

/// Categorical estimate of the author's skill as reflected in the code.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SkillLevel {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
    Expert,
}

impl SkillLevel {
    pub fn from_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "beginner" | "novice" | "junior" => SkillLevel::Beginner,
            "advanced" | "senior" => SkillLevel::Advanced,
            "expert" => SkillLevel::Expert,
            _ => SkillLevel::Intermediate,
        }
    }
}

impl fmt::Display for SkillLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillLevel::Beginner => write!(f, "beginner"),
            SkillLevel::Intermediate => write!(f, "intermediate"),
            SkillLevel::Advanced => write!(f, "advanced"),
            SkillLevel::Expert => write!(f, "expert"),
        }
    }
}

/// A single problem reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Free-form category (e.g. "injection", "allocation").
    pub category: String,
    pub severity: Severity,
    pub message: String,
    /// 1-indexed line, when the provider could locate it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl Finding {
    /// Identity used when merging findings across providers.
    pub fn merge_key(&self) -> (String, String) {
        (
            self.category.trim().to_lowercase(),
            self.message.trim().to_lowercase(),
        )
    }
}

/// The structured body every provider returns, whatever the kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// 0.0 (trivial) to 10.0 (very complex).
    #[serde(default)]
    pub complexity_score: f64,
    #[serde(default)]
    pub skill_level: SkillLevel,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Outcome of one provider call. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub provider_id: String,
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AnalysisOutput>,
    /// Confidence in [0, 1]; 0 for failures.
    pub confidence: f64,
    /// Tokens consumed (prompt + completion, estimated when not reported).
    #[serde(default)]
    pub tokens_used: u64,
    pub elapsed_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelResult {
    /// Build a successful result.
    pub fn succeeded(
        descriptor: &ProviderDescriptor,
        output: AnalysisOutput,
        confidence: f64,
        tokens_used: u64,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            provider_id: descriptor.id.clone(),
            backend: descriptor.backend,
            output: Some(output),
            confidence: confidence.clamp(0.0, 1.0),
            tokens_used,
            elapsed_ms,
            success: true,
            error: None,
        }
    }

    /// Build a failed result with confidence 0.
    pub fn failed(
        descriptor: &ProviderDescriptor,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            provider_id: descriptor.id.clone(),
            backend: descriptor.backend,
            output: None,
            confidence: 0.0,
            tokens_used: 0,
            elapsed_ms,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Algorithm used to reduce several results to one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    #[default]
    ConfidenceBased,
    WeightedAverage,
    MajorityVote,
    BestScore,
}

impl ConsensusMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMethod::ConfidenceBased => "confidence_based",
            ConsensusMethod::WeightedAverage => "weighted_average",
            ConsensusMethod::MajorityVote => "majority_vote",
            ConsensusMethod::BestScore => "best_score",
        }
    }
}

impl fmt::Display for ConsensusMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "confidence_based" | "confidence" => Ok(ConsensusMethod::ConfidenceBased),
            "weighted_average" | "weighted" => Ok(ConsensusMethod::WeightedAverage),
            "majority_vote" | "majority" => Ok(ConsensusMethod::MajorityVote),
            "best_score" | "best" => Ok(ConsensusMethod::BestScore),
            other => Err(format!("unknown consensus method: {}", other)),
        }
    }
}

/// Merged outcome of an ensemble call. Always backed by at least one success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub output: AnalysisOutput,
    /// Consensus confidence in [0, 1].
    pub confidence: f64,
    /// Method actually applied (may differ from the requested one).
    pub method: ConsensusMethod,
    /// Providers whose successful results contributed.
    pub providers: Vec<String>,
    pub per_model_confidences: BTreeMap<String, f64>,
    /// Providers that failed, with the recorded error.
    #[serde(default)]
    pub failures: BTreeMap<String, String>,
    /// True when the rule-based fallback supplied the result.
    pub fallback_used: bool,
    /// Estimated spend across contributing providers, in USD.
    #[serde(default)]
    pub estimated_cost: f64,
    pub elapsed_ms: u64,
}

/// Ensemble details attached to an [`AnalysisResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMetadata {
    pub models_used: Vec<String>,
    pub consensus_confidence: f64,
    pub consensus_method: ConsensusMethod,
    pub per_model_confidences: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_models: BTreeMap<String, String>,
    #[serde(default)]
    pub estimated_cost: f64,
}

/// Value stored in the analysis cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CachedAnalysis {
    Consensus(ConsensusResult),
    Single(ModelResult),
}

/// The result handed back to callers for one candidate and one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub kind: AnalysisKind,
    pub patterns: Vec<String>,
    pub findings: Vec<Finding>,
    pub complexity_score: f64,
    pub skill_level: SkillLevel,
    pub suggestions: Vec<String>,
    pub confidence: f64,
    pub elapsed_ms: u64,
    /// False when only the rule-based fallback produced the result.
    pub ai_powered: bool,
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble_metadata: Option<EnsembleMetadata>,
}

impl AnalysisResponse {
    pub fn from_cached(kind: AnalysisKind, cached: CachedAnalysis) -> Self {
        match cached {
            CachedAnalysis::Consensus(consensus) => {
                let output = consensus.output;
                Self {
                    kind,
                    patterns: output.patterns,
                    findings: output.findings,
                    complexity_score: output.complexity_score,
                    skill_level: output.skill_level,
                    suggestions: output.suggestions,
                    confidence: consensus.confidence,
                    elapsed_ms: consensus.elapsed_ms,
                    ai_powered: !consensus.fallback_used,
                    providers: consensus.providers.clone(),
                    ensemble_metadata: Some(EnsembleMetadata {
                        models_used: consensus.providers,
                        consensus_confidence: consensus.confidence,
                        consensus_method: consensus.method,
                        per_model_confidences: consensus.per_model_confidences,
                        failed_models: consensus.failures,
                        estimated_cost: consensus.estimated_cost,
                    }),
                }
            }
            CachedAnalysis::Single(result) => {
                let output = result.output.unwrap_or_default();
                Self {
                    kind,
                    patterns: output.patterns,
                    findings: output.findings,
                    complexity_score: output.complexity_score,
                    skill_level: output.skill_level,
                    suggestions: output.suggestions,
                    confidence: result.confidence,
                    elapsed_ms: result.elapsed_ms,
                    ai_powered: result.backend != BackendKind::RuleBased,
                    providers: vec![result.provider_id],
                    ensemble_metadata: None,
                }
            }
        }
    }
}

/// Stable identity of a repository, used to key snapshots.
///
/// Remote URLs are normalized so `https://github.com/Owner/Repo.git` and
/// `git@github.com:owner/repo` name the same repository. Local directories
/// are keyed by their canonical path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryIdentity(String);

impl RepositoryIdentity {
    pub fn from_remote(url: &str) -> Self {
        let mut url = url.trim().trim_end_matches('/').to_lowercase();
        if let Some(stripped) = url.strip_suffix(".git") {
            url = stripped.to_string();
        }
        for scheme in ["https://", "http://", "ssh://", "git://"] {
            if let Some(rest) = url.strip_prefix(scheme) {
                url = rest.to_string();
                break;
            }
        }
        if let Some(rest) = url.strip_prefix("git@") {
            url = rest.replacen(':', "/", 1);
        }
        if let Some((_, host_path)) = url.split_once('@') {
            url = host_path.to_string();
        }
        Self(url)
    }

    pub fn from_local(path: &Path) -> Self {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self(format!("local:{}", canonical.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// All analyses of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    /// Path to the file (relative to repo root).
    pub path: String,
    /// Detected programming language.
    pub language: String,
    /// Total number of lines in the file.
    pub line_count: usize,
    /// Digest of the analyzed text.
    pub content_digest: String,
    /// One response per analysis kind.
    pub analyses: BTreeMap<AnalysisKind, AnalysisResponse>,
}

impl FileReport {
    /// All findings across kinds.
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.analyses.values().flat_map(|a| a.findings.iter())
    }

    pub fn finding_count(&self) -> usize {
        self.analyses.values().map(|a| a.findings.len()).sum()
    }
}

/// Aggregate statistics, always recomputed from the file map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub files_analyzed: usize,
    pub total_findings: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub by_category: BTreeMap<String, usize>,
    pub pattern_counts: BTreeMap<String, usize>,
    pub total_patterns: usize,
    pub average_complexity: f64,
    pub average_confidence: f64,
    /// Analyses backed by at least one model provider.
    pub ai_powered_analyses: usize,
    /// Analyses answered only by the rule-based fallback.
    pub fallback_analyses: usize,
}

/// A full repository analysis report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryReport {
    pub repository: RepositoryIdentity,
    /// Source revision the report reflects.
    pub revision: String,
    pub analyzed_at: DateTime<Utc>,
    pub files: BTreeMap<String, FileReport>,
    pub summary: ReportSummary,
}

impl RepositoryReport {
    /// Build a report and compute its summary from `files`.
    pub fn new(
        repository: RepositoryIdentity,
        revision: impl Into<String>,
        analyzed_at: DateTime<Utc>,
        files: BTreeMap<String, FileReport>,
    ) -> Self {
        let summary = crate::analysis::summarize(files.values());
        Self {
            repository,
            revision: revision.into(),
            analyzed_at,
            files,
            summary,
        }
    }
}
