//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation. Flags that mirror configuration values are
//! optional so that file settings apply unless a flag is given.

use crate::models::{AnalysisKind, ConsensusMethod, Severity};
use clap::Parser;
use std::path::PathBuf;

/// YoInsight - ensemble code insight for git repositories
///
/// Runs pattern, quality, security and performance analyses over a repository
/// with every available model provider, merges their answers, caches the
/// results and re-analyzes only changed files on later runs.
///
/// Examples:
///   yoinsight --repo https://github.com/owner/repo.git
///   yoinsight --repo local --local ./my-project --format json
///   yoinsight --repo https://github.com/owner/repo.git --method majority_vote
///   yoinsight --repo local --local . --kinds security --fail-on high
///   yoinsight --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Repository URL to analyze, or `local` together with --local
    #[arg(short, long, value_name = "URL", required_unless_present = "init_config")]
    pub repo: Option<String>,

    /// Local directory to analyze instead of cloning
    #[arg(long, value_name = "DIR")]
    pub local: Option<PathBuf>,

    /// Specific branch to analyze
    #[arg(short, long, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Path to configuration file
    ///
    /// If not specified, looks for .yoinsight.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    // === Ensemble ===
    /// Shared deadline for one ensemble call, in seconds
    #[arg(long, value_name = "SECS", env = "YOINSIGHT_ENSEMBLE_TIMEOUT")]
    pub ensemble_timeout: Option<f64>,

    /// Successful providers needed before voting strategies apply
    #[arg(long, value_name = "COUNT")]
    pub min_providers: Option<usize>,

    /// Consensus method (confidence_based, weighted_average, majority_vote, best_score)
    #[arg(long, value_name = "METHOD")]
    pub method: Option<ConsensusMethod>,

    /// Route every analysis to a single provider id instead of the ensemble
    #[arg(long, value_name = "PROVIDER")]
    pub pin_provider: Option<String>,

    /// Model for the first local provider
    #[arg(short, long, env = "YOINSIGHT_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL for local providers
    #[arg(long, value_name = "URL", env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Print provider status after discovery and exit
    #[arg(long)]
    pub list_providers: bool,

    // === Cache ===
    /// Redis URL for the shared analysis cache
    #[arg(long, value_name = "URL", env = "YOINSIGHT_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Invalidate cache entries carrying this tag before the run
    ///
    /// Tags look like `kind:security`, `lang:rust` or `provider:<id>`.
    #[arg(long, value_name = "TAG")]
    pub invalidate_tag: Vec<String>,

    // === Incremental ===
    /// Ignore the stored snapshot and analyze every file
    #[arg(long)]
    pub full: bool,

    /// Disable incremental runs entirely (no snapshot is read)
    #[arg(long)]
    pub no_incremental: bool,

    /// Changed-file count above which a full run is forced
    #[arg(long, value_name = "COUNT")]
    pub max_changed_files: Option<usize>,

    /// Directory for repository snapshots
    #[arg(long, value_name = "DIR")]
    pub snapshot_dir: Option<PathBuf>,

    // === Analysis ===
    /// Analysis kinds to run (comma-separated)
    ///
    /// Example: --kinds security,quality
    #[arg(long, value_name = "KINDS", value_delimiter = ',')]
    pub kinds: Option<Vec<AnalysisKind>>,

    /// Number of concurrent file analyses
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Maximum number of files to analyze
    #[arg(long, value_name = "COUNT")]
    pub max_files: Option<usize>,

    /// File extensions to include (comma-separated)
    ///
    /// Example: --extensions rs,py,js
    #[arg(long, value_name = "EXTS", value_delimiter = ',')]
    pub extensions: Option<Vec<String>>,

    /// Directory or file names to exclude (comma-separated)
    ///
    /// Example: --exclude vendor,generated
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub exclude: Option<Vec<String>>,

    // === Output filtering ===
    /// Fail if findings at or above this severity are found
    ///
    /// Useful for CI pipelines. Exit code 2 when threshold is exceeded.
    /// Values: critical, high, medium, low
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<SeverityLevel>,

    /// Minimum severity to include in the report
    ///
    /// Findings below this level are filtered out. Values: critical, high, medium, low
    #[arg(long, value_name = "LEVEL")]
    pub min_severity: Option<SeverityLevel>,

    /// Dry run: scan and list the files that would be analyzed
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .yoinsight.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Severity level for --fail-on and --min-severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum SeverityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl From<SeverityLevel> for Severity {
    fn from(level: SeverityLevel) -> Self {
        match level {
            SeverityLevel::Low => Severity::Low,
            SeverityLevel::Medium => Severity::Medium,
            SeverityLevel::High => Severity::High,
            SeverityLevel::Critical => Severity::Critical,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn repo_url(&self) -> &str {
        self.repo.as_deref().unwrap_or("")
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        let repo = self.repo_url();

        if self.local.is_none()
            && !repo.starts_with("https://")
            && !repo.starts_with("http://")
            && !repo.starts_with("git@")
            && !repo.starts_with("ssh://")
        {
            return Err("Repository URL must start with 'https://' or 'git@'".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(ref url) = self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err("Redis URL must start with 'redis://' or 'rediss://'".to_string());
            }
        }

        if let Some(timeout) = self.ensemble_timeout {
            if !timeout.is_finite() || timeout <= 0.0 {
                return Err("Ensemble timeout must be a positive number of seconds".to_string());
            }
        }

        if self.min_providers == Some(0) {
            return Err("Min providers must be at least 1".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.max_files == Some(0) {
            return Err("Max files must be at least 1".to_string());
        }

        if matches!(self.kinds, Some(ref kinds) if kinds.is_empty()) {
            return Err("At least one analysis kind is required".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref local_path) = self.local {
            if !local_path.exists() {
                return Err(format!(
                    "Local directory does not exist: {}",
                    local_path.display()
                ));
            }
            if !local_path.is_dir() {
                return Err(format!(
                    "Local path is not a directory: {}",
                    local_path.display()
                ));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
