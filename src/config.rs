//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.yoinsight.toml` files.

use crate::models::{AnalysisKind, ConsensusMethod};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory and
/// in analyzed repositories.
pub const CONFIG_FILE_NAME: &str = ".yoinsight.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Ensemble dispatch and consensus settings.
    #[serde(default)]
    pub ensemble: EnsembleConfig,

    /// Model provider declarations.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Analysis cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Incremental analysis settings.
    #[serde(default)]
    pub incremental: IncrementalConfig,

    /// Which analyses to run per file.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Scanner settings.
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "yoinsight_report.md".to_string()
}

/// Ensemble settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Shared deadline for one ensemble call, in seconds.
    #[serde(default = "default_ensemble_timeout")]
    pub timeout_seconds: f64,

    /// Minimum successful providers before voting; below this the
    /// best-scoring single result is used.
    #[serde(default = "default_min_providers")]
    pub min_providers: usize,

    /// Default consensus method.
    #[serde(default)]
    pub method: ConsensusMethod,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_ensemble_timeout(),
            min_providers: default_min_providers(),
            method: ConsensusMethod::default(),
        }
    }
}

impl EnsembleConfig {
    pub fn deadline(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_ensemble_timeout()))
    }
}

fn default_ensemble_timeout() -> f64 {
    30.0
}

fn default_min_providers() -> usize {
    2
}

/// Provider declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Locally served Ollama models.
    #[serde(default = "default_local_providers")]
    pub local: Vec<LocalProviderConfig>,

    /// Remote OpenAI-compatible APIs.
    #[serde(default)]
    pub remote: Vec<RemoteProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            local: default_local_providers(),
            remote: Vec::new(),
        }
    }
}

fn default_local_providers() -> Vec<LocalProviderConfig> {
    vec![LocalProviderConfig::default()]
}

/// One Ollama model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub url: String,

    /// Model name as known to Ollama.
    #[serde(default = "default_model")]
    pub model: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Context window in tokens.
    #[serde(default = "default_local_context")]
    pub context_window: usize,

    /// Static trust weight for `weighted_average`.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_ollama_url(),
            model: default_model(),
            temperature: default_temperature(),
            context_window: default_local_context(),
            weight: default_weight(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_local_context() -> usize {
    8192
}

fn default_weight() -> f64 {
    1.0
}

/// One remote API model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Provider name used in the provider id.
    pub name: String,

    /// Base URL of the OpenAI-compatible API (without `/chat/completions`).
    #[serde(default = "default_remote_url")]
    pub base_url: String,

    /// Model identifier.
    pub model: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Maximum completion tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Declared cost in USD per 1000 tokens.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,

    #[serde(default = "default_remote_context")]
    pub context_window: usize,

    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Request budget; requests are spaced to stay under it.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Number of retries on 429 / 5xx responses.
    #[serde(default = "default_retries")]
    pub retries: usize,
}

fn default_remote_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_remote_context() -> usize {
    128_000
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_retries() -> usize {
    2
}

/// Analysis cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL; when unset only the in-process cache is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    /// Redis connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Entry limit of the in-process cache.
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,

    /// Per-kind TTLs.
    #[serde(default)]
    pub ttl: CacheTtlConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_memory_entries: default_max_memory_entries(),
            ttl: CacheTtlConfig::default(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_max_memory_entries() -> usize {
    10_000
}

/// TTL per analysis kind, in seconds. Security results age fastest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    #[serde(default = "default_pattern_ttl")]
    pub pattern_seconds: u64,
    #[serde(default = "default_quality_ttl")]
    pub quality_seconds: u64,
    #[serde(default = "default_security_ttl")]
    pub security_seconds: u64,
    #[serde(default = "default_performance_ttl")]
    pub performance_seconds: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            pattern_seconds: default_pattern_ttl(),
            quality_seconds: default_quality_ttl(),
            security_seconds: default_security_ttl(),
            performance_seconds: default_performance_ttl(),
        }
    }
}

impl CacheTtlConfig {
    pub fn for_kind(&self, kind: AnalysisKind) -> Duration {
        let secs = match kind {
            AnalysisKind::Pattern => self.pattern_seconds,
            AnalysisKind::Quality => self.quality_seconds,
            AnalysisKind::Security => self.security_seconds,
            AnalysisKind::Performance => self.performance_seconds,
        };
        Duration::from_secs(secs)
    }
}

fn default_pattern_ttl() -> u64 {
    24 * 3600
}

fn default_quality_ttl() -> u64 {
    12 * 3600
}

fn default_security_ttl() -> u64 {
    3600
}

fn default_performance_ttl() -> u64 {
    12 * 3600
}

/// Incremental analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Reuse snapshots between runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Change sets larger than this force a full re-analysis.
    #[serde(default = "default_max_changed_files")]
    pub max_changed_files: usize,

    /// Directory holding snapshot files.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_changed_files: default_max_changed_files(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

fn default_max_changed_files() -> usize {
    50
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(".yoinsight/snapshots")
}

/// Per-file analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Kinds run for every candidate.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<AnalysisKind>,

    /// Number of candidates analyzed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_kinds() -> Vec<AnalysisKind> {
    AnalysisKind::ALL.to_vec()
}

fn default_concurrency() -> usize {
    4
}

/// File scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum files to analyze.
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// File extensions to include.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Patterns to exclude.
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,

    /// Maximum file size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            extensions: default_extensions(),
            excludes: default_excludes(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_max_files() -> usize {
    500
}

fn default_extensions() -> Vec<String> {
    vec![
        "rs", "py", "js", "ts", "jsx", "tsx", "go", "java", "c", "cpp", "h", "hpp", "cs", "rb",
        "php", "swift", "kt", "scala",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_excludes() -> Vec<String> {
    vec![
        ".git",
        "target",
        "node_modules",
        "vendor",
        "dist",
        "build",
        "__pycache__",
        ".venv",
        "venv",
        ".yoinsight",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_file_size() -> usize {
    256 * 1024
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Include suggestion lists in the Markdown report.
    #[serde(default = "default_true")]
    pub include_suggestions: bool,

    /// Number of patterns listed in the summary.
    #[serde(default = "default_top_patterns")]
    pub top_patterns: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            include_suggestions: true,
            top_patterns: default_top_patterns(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_top_patterns() -> usize {
    10
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Try to load configuration from a repo directory.
    pub fn load_from_repo(repo_path: &Path) -> Result<Option<Self>> {
        let config_path = repo_path.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            Ok(Some(Self::load(&config_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments (and their environment variables) take precedence over
    /// config file settings, but only when explicitly provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(timeout) = args.ensemble_timeout {
            self.ensemble.timeout_seconds = timeout;
        }
        if let Some(min) = args.min_providers {
            self.ensemble.min_providers = min;
        }
        if let Some(method) = args.method {
            self.ensemble.method = method;
        }

        if let Some(ref model) = args.model {
            if let Some(first) = self.providers.local.first_mut() {
                first.model = model.clone();
            }
        }
        if let Some(ref url) = args.ollama_url {
            for local in &mut self.providers.local {
                local.url = url.clone();
            }
        }

        if let Some(ref redis_url) = args.redis_url {
            self.cache.redis_url = Some(redis_url.clone());
        }

        if let Some(threshold) = args.max_changed_files {
            self.incremental.max_changed_files = threshold;
        }
        if let Some(ref dir) = args.snapshot_dir {
            self.incremental.snapshot_dir = dir.clone();
        }
        if args.no_incremental {
            self.incremental.enabled = false;
        }

        if let Some(ref kinds) = args.kinds {
            self.analysis.kinds = kinds.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.analysis.concurrency = concurrency;
        }

        if let Some(max_files) = args.max_files {
            self.scanner.max_files = max_files;
        }
        if let Some(ref extensions) = args.extensions {
            self.scanner.extensions = extensions.clone();
        }
        if let Some(ref excludes) = args.exclude {
            self.scanner.excludes = excludes.clone();
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ensemble.timeout_seconds, 30.0);
        assert_eq!(config.ensemble.deadline(), Duration::from_secs(30));
        assert_eq!(config.ensemble.min_providers, 2);
        assert_eq!(config.ensemble.method, ConsensusMethod::ConfidenceBased);
        assert_eq!(config.providers.local.len(), 1);
        assert!(config.cache.redis_url.is_none());
        assert_eq!(config.analysis.kinds.len(), 4);
    }

    #[test]
    fn test_security_ttl_is_shortest() {
        let ttl = CacheTtlConfig::default();
        let security = ttl.for_kind(AnalysisKind::Security);
        for kind in AnalysisKind::ALL {
            assert!(ttl.for_kind(kind) >= security);
        }
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[ensemble]
timeout_seconds = 12.5
method = "majority_vote"

[[providers.local]]
model = "codellama:34b"

[[providers.remote]]
name = "openai"
model = "gpt-4o-mini"
cost_per_1k_tokens = 0.00015

[cache]
redis_url = "redis://127.0.0.1:6379"

[cache.ttl]
security_seconds = 600

[incremental]
max_changed_files = 10

[analysis]
kinds = ["security", "quality"]
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.ensemble.deadline(), Duration::from_millis(12_500));
        assert_eq!(config.ensemble.method, ConsensusMethod::MajorityVote);
        assert_eq!(config.providers.local[0].model, "codellama:34b");
        assert_eq!(config.providers.local[0].url, "http://localhost:11434");
        assert_eq!(config.providers.remote[0].api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.cache.ttl.security_seconds, 600);
        assert_eq!(config.cache.ttl.pattern_seconds, 24 * 3600);
        assert_eq!(config.incremental.max_changed_files, 10);
        assert_eq!(
            config.analysis.kinds,
            vec![AnalysisKind::Security, AnalysisKind::Quality]
        );
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[ensemble]"));
        assert!(toml_str.contains("[cache.ttl]"));
        assert!(toml_str.contains("[scanner]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.incremental.max_changed_files, 50);
    }
}
