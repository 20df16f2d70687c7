//! Git repository cloning.
//!
//! Clones go to a temporary directory unless a target is given. History is
//! fetched in full by default so later runs can diff against the revision of
//! the stored snapshot.

use anyhow::{Context, Result};
use git2::{FetchOptions, Progress, RemoteCallbacks, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// Result of a successful clone operation.
pub struct CloneResult {
    /// Path to the cloned repository.
    pub path: PathBuf,
    /// Temporary directory handle (keeps the directory alive).
    /// If None, the repository was cloned to a persistent location.
    pub temp_dir: Option<TempDir>,
}

impl CloneResult {
    pub fn repo_path(&self) -> &Path {
        &self.path
    }
}

/// Options for cloning a repository.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Branch to checkout (None for default branch).
    pub branch: Option<String>,
    /// Depth for shallow clone (None for full history).
    pub depth: Option<i32>,
    /// Whether to show progress.
    pub show_progress: bool,
    /// Target directory (None for temp directory).
    pub target_dir: Option<PathBuf>,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            branch: None,
            depth: None,
            show_progress: true,
            target_dir: None,
        }
    }
}

/// Clone a repository from a URL.
pub fn clone_repository(url: &str, options: CloneOptions) -> Result<CloneResult> {
    info!("Cloning repository: {}", url);

    // Determine the target path
    let (path, temp_dir) = if let Some(target) = options.target_dir {
        if target.exists() {
            debug!("Target directory already exists: {}", target.display());
            // Try to open existing repository
            if Repository::open(&target).is_ok() {
                info!("Using existing repository at: {}", target.display());
                return Ok(CloneResult {
                    path: target,
                    temp_dir: None,
                });
            }
        }
        (target, None)
    } else {
        let temp = TempDir::new().context("Failed to create temporary directory")?;
        let path = temp.path().to_path_buf();
        (path, Some(temp))
    };

    debug!("Clone target: {}", path.display());

    // Set up progress callback
    let progress_bar = if options.show_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(Arc::new(pb))
    } else {
        None
    };

    let pb_clone = progress_bar.clone();
    let mut callbacks = RemoteCallbacks::new();

    callbacks.transfer_progress(move |progress: Progress<'_>| {
        if let Some(ref pb) = pb_clone {
            pb.set_length(progress.total_objects() as u64);
            pb.set_position(progress.received_objects() as u64);
        }
        true
    });

    // Set up fetch options
    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(callbacks);

    if let Some(depth) = options.depth {
        fetch_opts.depth(depth);
    }

    // Build the repository
    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_opts);

    if let Some(ref branch) = options.branch {
        builder.branch(branch);
    }

    // Perform the clone
    builder
        .clone(url, &path)
        .with_context(|| format!("Failed to clone repository: {}", url))?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Clone complete");
    }

    info!("Successfully cloned repository to: {}", path.display());

    Ok(CloneResult { path, temp_dir })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_options_default() {
        let opts = CloneOptions::default();
        assert!(opts.branch.is_none());
        assert_eq!(opts.depth, None);
        assert!(opts.show_progress);
    }

    #[test]
    fn test_clone_from_local_path() {
        let origin = tempfile::tempdir().unwrap();
        let repo = Repository::init(origin.path()).unwrap();
        std::fs::write(origin.path().join("lib.rs"), "pub fn f() {}\n").unwrap();
        crate::test_support::commit_all(&repo, "initial");

        let target = tempfile::tempdir().unwrap();
        let options = CloneOptions {
            show_progress: false,
            target_dir: Some(target.path().join("clone")),
            ..CloneOptions::default()
        };
        let result = clone_repository(&origin.path().to_string_lossy(), options).unwrap();
        assert!(result.path.join("lib.rs").exists());
        assert!(result.temp_dir.is_none());
    }
}
