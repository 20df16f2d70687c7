//! YoInsight - ensemble code insight for git repositories
//!
//! Clones (or opens) a repository, analyzes its source files with every
//! available model provider, and writes a Markdown or JSON report.
//!
//! Exit codes:
//!   0 - Success (no findings above threshold, or no --fail-on set)
//!   1 - Runtime error (config, clone failure, unknown provider, etc.)
//!   2 - Findings found at or above the --fail-on threshold

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use yoinsight::analysis::{count_at_or_above, filter_by_severity};
use yoinsight::cache::AnalysisCache;
use yoinsight::cli::{Args, OutputFormat};
use yoinsight::config::{Config, CONFIG_FILE_NAME};
use yoinsight::coordinator::AnalysisCoordinator;
use yoinsight::ensemble::EnsembleOrchestrator;
use yoinsight::incremental::{
    ChangeDetector, FileSnapshotStore, IncrementalEngine, StaticChangeDetector,
};
use yoinsight::models::{RepositoryIdentity, Severity};
use yoinsight::providers::build_providers;
use yoinsight::repo::{self, GitChangeDetector};
use yoinsight::report::{self, ReportMetadata, ReportOptions};
use yoinsight::scanner::{FileScanner, ScanConfig, WorkingTreeSource};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("YoInsight v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .yoinsight.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to configure providers, consensus, cache and snapshots.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// The checked-out code and where it came from.
struct Checkout {
    path: PathBuf,
    identity: RepositoryIdentity,
    source: String,
    /// Keeps a fresh clone alive for the duration of the run.
    _temp_dir: Option<TempDir>,
}

/// Run the complete workflow. Returns exit code (0 or 2).
async fn run(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let checkout = get_repository(&args, &config)?;
    info!("Repository at: {}", checkout.path.display());

    if args.config.is_none() {
        if let Ok(Some(repo_config)) = Config::load_from_repo(&checkout.path) {
            info!("Found {} in repository", CONFIG_FILE_NAME);
            config = repo_config;
            config.merge_with_args(&args);
        }
    }

    let scanner = FileScanner::new(checkout.path.clone(), ScanConfig::from(&config.scanner));

    // Non-git directories have no revision to diff against. Uncommitted
    // edits to scanned files get their own revision and never a snapshot.
    let (revision, timestamp, versioned, dirty) = match repo::head_commit(&checkout.path) {
        Ok(head) => {
            let dirty = match repo::dirty_paths(&checkout.path) {
                Ok(paths) => {
                    let count = paths.iter().filter(|p| scanner.covers(p)).count();
                    if count > 0 {
                        println!("⚠️  {} uncommitted change(s); analyzing in full", count);
                    }
                    count > 0
                }
                Err(e) => {
                    warn!("Cannot read working tree status ({}); treating it as modified", e);
                    true
                }
            };
            let revision = if dirty {
                format!("{}+dirty", head.revision)
            } else {
                head.revision
            };
            (revision, head.timestamp, true, dirty)
        }
        Err(e) => {
            warn!("No commit to anchor snapshots ({}); running a full analysis", e);
            ("worktree".to_string(), chrono::Utc::now(), false, false)
        }
    };
    info!(identity = %checkout.identity, revision = %revision, "Resolved repository");

    let source = WorkingTreeSource::new(scanner, revision.clone(), timestamp);
    let detector: Box<dyn ChangeDetector> = if versioned {
        Box::new(GitChangeDetector::new(checkout.path.clone()))
    } else {
        Box::new(StaticChangeDetector::failing("not a git repository"))
    };

    let store = Arc::new(FileSnapshotStore::new(config.incremental.snapshot_dir.clone()));
    let engine = Arc::new(IncrementalEngine::new(store, config.incremental.clone()));
    let ensemble = Arc::new(EnsembleOrchestrator::new(
        build_providers(&config.providers),
        config.ensemble.clone(),
    ));
    let build_coordinator = |cache: Arc<AnalysisCache>| {
        let coordinator = AnalysisCoordinator::new(
            Arc::clone(&ensemble),
            cache,
            Arc::clone(&engine),
            config.analysis.clone(),
        )
        .with_pinned_provider(args.pin_provider.clone())
        .with_forced_full(args.full || !versioned || dirty)
        .with_snapshot_persistence(!dirty);
        match args.method {
            Some(method) => coordinator.with_method(method),
            None => coordinator,
        }
    };

    if args.dry_run {
        let planner = build_coordinator(Arc::new(AnalysisCache::memory_only(&config.cache)));
        return handle_dry_run(&checkout, &revision, &source, detector.as_ref(), &planner).await;
    }

    println!("🤖 Discovering providers...");
    let descriptors = ensemble.discover().await;

    if args.list_providers {
        print_providers(&descriptors);
        return Ok(0);
    }

    let available: Vec<String> = descriptors
        .iter()
        .filter(|d| d.available)
        .map(|d| d.id.clone())
        .collect();
    if available.is_empty() {
        println!("   No model provider reachable; using rule-based analysis.");
    } else {
        println!("   Available: {}", available.join(", "));
    }

    let cache = Arc::new(AnalysisCache::connect(&config.cache).await);
    for tag in &args.invalidate_tag {
        let removed = cache.invalidate(tag).await;
        println!("🧹 Invalidated {} cache entr(ies) tagged {}", removed, tag);
    }

    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    };

    let coordinator = build_coordinator(Arc::clone(&cache)).with_progress(progress.clone());

    println!("\n🔬 Analyzing {}...", checkout.source);
    let run = coordinator
        .analyze_repository(&checkout.identity, &revision, &source, detector.as_ref())
        .await?;
    progress.finish_and_clear();

    let run = match args.min_severity {
        Some(level) => {
            let mut filtered = run.clone();
            filtered.report = filter_by_severity(&run.report, level.into());
            filtered
        }
        None => run,
    };

    println!("\n📝 Generating report...");
    let duration = start_time.elapsed().as_secs_f64();
    let metadata = ReportMetadata {
        source: checkout.source.clone(),
        providers: ensemble.provider_ids(),
        cache_backend: cache.backend_name().to_string(),
        duration_seconds: duration,
    };

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.general.output));
    let content = match args.format {
        OutputFormat::Json => report::generate_json_report(&run, &metadata)?,
        OutputFormat::Markdown => {
            report::generate_markdown_report(&run, &metadata, &ReportOptions::from(&config.report))
        }
    };
    report::write_report(&content, &output_path)?;

    let summary = &run.report.summary;
    println!("\n📊 Analysis Summary:");
    println!(
        "   Run: {} ({}), {} analyzed, {} reused, {} removed",
        run.mode, run.reason, run.analyzed_files, run.reused_files, run.removed_files
    );
    println!("   Files in report: {}", summary.files_analyzed);
    println!("   Total findings: {}", summary.total_findings);
    println!(
        "   - 🔴 Critical: {} | 🟠 High: {} | 🟡 Medium: {} | 🟢 Low: {}",
        summary.critical, summary.high, summary.medium, summary.low
    );
    println!("   Duration: {:.1}s", duration);
    println!("\n✅ Analysis complete! Report saved to: {}", output_path.display());

    if let Some(level) = args.fail_on {
        let threshold: Severity = level.into();
        if count_at_or_above(summary, threshold) > 0 {
            eprintln!(
                "\n⛔ Findings at or above {} severity. Failing (exit code 2).",
                threshold
            );
            return Ok(2);
        }
    }

    Ok(0)
}

/// Handle --dry-run: show what a run would analyze, without calling providers.
async fn handle_dry_run(
    checkout: &Checkout,
    revision: &str,
    source: &WorkingTreeSource,
    detector: &dyn ChangeDetector,
    coordinator: &AnalysisCoordinator,
) -> Result<i32> {
    println!("\n🔍 Dry run: scanning files (no provider calls)...\n");

    let decision = coordinator.plan(&checkout.identity, revision, detector).await;

    if !decision.force_full {
        let change_set = decision.change_set.unwrap_or_default();
        println!("   Incremental: {}", decision.reason);
        for (path, kind) in change_set.iter() {
            println!("     {:?} {}", kind, path);
        }
        println!("\n   Total: {} changed path(s)", change_set.len());
    } else {
        println!("   Full: {}", decision.reason);
        let files = source.scanner().scan()?;
        if files.is_empty() {
            println!("   No matching source files found.");
        } else {
            println!("   Found {} files that would be analyzed:\n", files.len());
            for file in &files {
                println!("     📄 {} ({} bytes)", file.path, file.size);
            }
            println!("\n   Total: {} files", files.len());
        }
    }

    println!("\n✅ Dry run complete. No provider calls were made.");
    Ok(0)
}

fn print_providers(descriptors: &[yoinsight::models::ProviderDescriptor]) {
    if descriptors.is_empty() {
        println!("   No model providers configured; the rule-based fallback will be used.");
        return;
    }
    println!("\n   {:<32} {:<12} {:<10} {:>10}", "PROVIDER", "BACKEND", "STATUS", "$/1K TOK");
    for d in descriptors {
        println!(
            "   {:<32} {:<12} {:<10} {:>10.4}",
            d.id,
            d.backend.to_string(),
            if d.available { "available" } else { "down" },
            d.cost_per_1k_tokens
        );
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE_NAME);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}

/// Open the local directory or clone the repository.
fn get_repository(args: &Args, config: &Config) -> Result<Checkout> {
    if let Some(ref local) = args.local {
        info!("Using local directory: {}", local.display());
        return Ok(Checkout {
            path: local.clone(),
            identity: RepositoryIdentity::from_local(local),
            source: local.display().to_string(),
            _temp_dir: None,
        });
    }

    let repo_url = args.repo_url();
    println!("📥 Cloning repository: {}", repo_url);

    // Shallow only when no snapshot diff is needed.
    let clone_options = repo::CloneOptions {
        branch: args.branch.clone(),
        depth: if config.incremental.enabled { None } else { Some(1) },
        show_progress: !args.quiet,
        target_dir: None,
    };

    let clone = repo::clone_repository(repo_url, clone_options)?;
    Ok(Checkout {
        path: clone.repo_path().to_path_buf(),
        identity: RepositoryIdentity::from_remote(repo_url),
        source: repo_url.to_string(),
        _temp_dir: clone.temp_dir,
    })
}
