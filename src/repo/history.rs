//! Revision lookups and tree diffs backed by git2.

use crate::error::ChangeError;
use crate::incremental::{ChangeDetector, ChangeKind, FileChange};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use git2::{Delta, DiffFindOptions, Repository, StatusOptions, Tree};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The checked-out commit of a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadCommit {
    pub revision: String,
    pub timestamp: DateTime<Utc>,
}

/// Resolve HEAD to its commit id and commit time.
pub fn head_commit(repo_path: &Path) -> Result<HeadCommit> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Not a git repository: {}", repo_path.display()))?;
    let commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .context("Repository has no commits")?;

    let timestamp = Utc
        .timestamp_opt(commit.time().seconds(), 0)
        .single()
        .unwrap_or_else(Utc::now);

    Ok(HeadCommit {
        revision: commit.id().to_string(),
        timestamp,
    })
}

/// Paths whose working-tree content differs from HEAD, in path order.
///
/// Untracked files count; ignored files do not.
pub fn dirty_paths(repo_path: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Not a git repository: {}", repo_path.display()))?;
    let mut options = StatusOptions::new();
    options
        .include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false)
        .exclude_submodules(true);
    let statuses = repo
        .statuses(Some(&mut options))
        .context("Failed to read working tree status")?;

    let mut paths: Vec<String> = statuses
        .iter()
        .filter(|entry| !entry.status().is_ignored())
        .filter_map(|entry| entry.path().map(str::to_string))
        .collect();
    paths.sort();
    paths.dedup();
    debug!("{} dirty path(s) in {}", paths.len(), repo_path.display());
    Ok(paths)
}

/// Lists files changed between two commits of a local repository.
///
/// The repository is reopened per call; `git2::Repository` is not `Sync`.
#[derive(Debug, Clone)]
pub struct GitChangeDetector {
    repo_path: PathBuf,
}

impl GitChangeDetector {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }
}

fn tree_at<'r>(repo: &'r Repository, revision: &str) -> Result<Tree<'r>, ChangeError> {
    let object = repo
        .revparse_single(revision)
        .map_err(|_| ChangeError::UnknownRevision(revision.to_string()))?;
    Ok(object.peel_to_tree()?)
}

fn path_of(file: git2::DiffFile<'_>) -> Option<String> {
    file.path().map(|p| {
        p.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    })
}

impl ChangeDetector for GitChangeDetector {
    fn changes(&self, from: &str, to: &str) -> Result<Vec<FileChange>, ChangeError> {
        let repo = Repository::open(&self.repo_path)?;
        let old_tree = tree_at(&repo, from)?;
        let new_tree = tree_at(&repo, to)?;

        let mut diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;
        let mut find = DiffFindOptions::new();
        find.renames(true);
        diff.find_similar(Some(&mut find))?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let old_path = path_of(delta.old_file());
            let new_path = path_of(delta.new_file());
            let change = match (delta.status(), old_path, new_path) {
                (Delta::Added | Delta::Copied, _, Some(path)) => {
                    FileChange::new(path, ChangeKind::Added)
                }
                (Delta::Modified | Delta::Typechange, _, Some(path)) => {
                    FileChange::new(path, ChangeKind::Modified)
                }
                (Delta::Deleted, Some(path), _) => FileChange::new(path, ChangeKind::Deleted),
                (Delta::Renamed, Some(from_path), Some(to_path)) => {
                    FileChange::renamed(from_path, to_path)
                }
                (status, _, _) => {
                    debug!("Ignoring diff entry with status {:?}", status);
                    continue;
                }
            };
            changes.push(change);
        }

        debug!("{} file(s) changed between {} and {}", changes.len(), from, to);
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::ChangeSet;
    use crate::test_support::commit_all;
    use std::fs;

    fn long_body(tag: &str) -> String {
        (0..40).map(|i| format!("fn {}_{}() {{}}\n", tag, i)).collect()
    }

    #[test]
    fn test_changes_between_commits() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("keep.rs"), "fn keep() {}\n").unwrap();
        fs::write(dir.path().join("edit.rs"), "fn before() {}\n").unwrap();
        fs::write(dir.path().join("gone.rs"), "fn gone() {}\n").unwrap();
        fs::write(dir.path().join("old_name.rs"), long_body("moved")).unwrap();
        let first = commit_all(&repo, "first");

        fs::write(dir.path().join("edit.rs"), "fn after() {}\n").unwrap();
        fs::remove_file(dir.path().join("gone.rs")).unwrap();
        fs::rename(dir.path().join("old_name.rs"), dir.path().join("new_name.rs")).unwrap();
        fs::write(dir.path().join("added.rs"), "fn added() {}\n").unwrap();
        let second = commit_all(&repo, "second");

        let detector = GitChangeDetector::new(dir.path());
        let changes = detector
            .changes(&first.to_string(), &second.to_string())
            .unwrap();
        let set = ChangeSet::from_changes(changes);

        assert_eq!(set.kind_of("added.rs"), Some(ChangeKind::Added));
        assert_eq!(set.kind_of("edit.rs"), Some(ChangeKind::Modified));
        assert_eq!(set.kind_of("gone.rs"), Some(ChangeKind::Deleted));
        assert_eq!(set.kind_of("old_name.rs"), Some(ChangeKind::Deleted));
        assert!(set.contains("new_name.rs"));
        assert!(!set.contains("keep.rs"));
    }

    #[test]
    fn test_unknown_revision() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        let head = commit_all(&repo, "only");

        let detector = GitChangeDetector::new(dir.path());
        let err = detector
            .changes("0123456789abcdef0123456789abcdef01234567", &head.to_string())
            .unwrap_err();
        assert!(matches!(err, ChangeError::UnknownRevision(_)));
    }

    #[test]
    fn test_head_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        let oid = commit_all(&repo, "only");

        let head = head_commit(dir.path()).unwrap();
        assert_eq!(head.revision, oid.to_string());
        let committed = repo.find_commit(oid).unwrap().time().seconds();
        assert_eq!(head.timestamp.timestamp(), committed);
    }

    #[test]
    fn test_dirty_paths() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        commit_all(&repo, "initial");
        assert!(dirty_paths(dir.path()).unwrap().is_empty());

        fs::write(dir.path().join("a.py"), "API_KEY = \"sk-live-1234567890\"\n").unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/b.py"), "y = 2\n").unwrap();
        fs::write(dir.path().join("run.log"), "noise").unwrap();

        assert_eq!(dirty_paths(dir.path()).unwrap(), vec!["a.py", "pkg/b.py"]);
    }

    #[test]
    fn test_head_commit_outside_git() {
        let dir = tempfile::tempdir().unwrap();
        assert!(head_commit(dir.path()).is_err());
    }
}
