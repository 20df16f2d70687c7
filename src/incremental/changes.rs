//! Change sets between two source revisions.

use crate::error::ChangeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One path reported by a [`ChangeDetector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Old path of a rename.
    pub previous_path: Option<String>,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            previous_path: None,
        }
    }

    pub fn renamed(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            path: to.into(),
            kind: ChangeKind::Renamed,
            previous_path: Some(from.into()),
        }
    }
}

/// Computes the files that differ between two revisions.
pub trait ChangeDetector: Send + Sync {
    fn changes(&self, from: &str, to: &str) -> Result<Vec<FileChange>, ChangeError>;
}

/// Paths changed since a snapshot, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    entries: BTreeMap<String, ChangeKind>,
}

impl ChangeSet {
    /// Build a change set; a rename also removes its old path.
    pub fn from_changes(changes: impl IntoIterator<Item = FileChange>) -> Self {
        let mut entries = BTreeMap::new();
        for change in changes {
            if let Some(old) = change.previous_path {
                if old != change.path {
                    entries.entry(old).or_insert(ChangeKind::Deleted);
                }
            }
            entries.insert(change.path, change.kind);
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn kind_of(&self, path: &str) -> Option<ChangeKind> {
        self.entries.get(path).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ChangeKind)> {
        self.entries.iter().map(|(p, k)| (p.as_str(), *k))
    }

    /// Paths whose current content needs analyzing.
    pub fn paths_to_analyze(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(_, k)| **k != ChangeKind::Deleted)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, k)| **k == ChangeKind::Deleted)
            .map(|(p, _)| p.as_str())
    }
}

/// Fixed answers, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticChangeDetector {
    changes: Vec<FileChange>,
    failure: Option<String>,
}

impl StaticChangeDetector {
    pub fn new(changes: Vec<FileChange>) -> Self {
        Self {
            changes,
            failure: None,
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            changes: Vec::new(),
            failure: Some(reason.into()),
        }
    }
}

impl ChangeDetector for StaticChangeDetector {
    fn changes(&self, from: &str, _to: &str) -> Result<Vec<FileChange>, ChangeError> {
        match &self.failure {
            Some(reason) if reason.is_empty() => {
                Err(ChangeError::UnknownRevision(from.to_string()))
            }
            Some(reason) => Err(ChangeError::SourceControl(reason.clone())),
            None => Ok(self.changes.clone()),
        }
    }
}
