//! File scanner for discovering and filtering source files.
//!
//! The scanner walks a working tree, respecting the configured extensions,
//! excludes and size limit, and turns matching files into analysis
//! candidates stamped with the checked-out commit.

use crate::incremental::CandidateSource;
use crate::models::AnalysisCandidate;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Configuration for file scanning.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// File extensions to include (e.g., ["rs", "py", "js"])
    pub extensions: Vec<String>,
    /// Names to exclude (e.g., ["node_modules", "target", ".git"])
    pub excludes: Vec<String>,
    /// Maximum file size in bytes
    pub max_file_size: usize,
    /// Maximum number of files in a full scan
    pub max_files: Option<usize>,
}

impl From<&crate::config::ScannerConfig> for ScanConfig {
    fn from(config: &crate::config::ScannerConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            excludes: config.excludes.clone(),
            max_file_size: config.max_file_size,
            max_files: Some(config.max_files),
        }
    }
}

/// Scanned file information.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Relative path from repo root, with `/` separators
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// File extension (without dot)
    pub extension: String,
}

/// Language tag for a file extension.
pub fn detect_language(extension: &str) -> String {
    let name = match extension {
        "rs" => "Rust",
        "py" => "Python",
        "js" | "jsx" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "go" => "Go",
        "java" => "Java",
        "c" | "h" => "C",
        "cpp" | "hpp" | "cc" => "C++",
        "cs" => "C#",
        "rb" => "Ruby",
        "php" => "PHP",
        "swift" => "Swift",
        "kt" => "Kotlin",
        "scala" => "Scala",
        other => other,
    };
    name.to_string()
}

/// File scanner for discovering source files.
pub struct FileScanner {
    config: ScanConfig,
    repo_root: PathBuf,
}

impl FileScanner {
    /// Create a new file scanner.
    pub fn new(repo_root: PathBuf, config: ScanConfig) -> Self {
        Self { config, repo_root }
    }

    pub fn root(&self) -> &Path {
        &self.repo_root
    }

    /// Scan for all matching files, in path order.
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        let mut files = Vec::new();

        let walker = WalkDir::new(&self.repo_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.is_excluded_entry(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(file) = self.scanned(entry.path()) {
                files.push(file);
                if self.config.max_files.is_some_and(|max| files.len() >= max) {
                    debug!("Reached max_files limit of {}", files.len());
                    break;
                }
            }
        }

        Ok(files)
    }

    /// Look up specific repository-relative paths. Missing or filtered
    /// paths are left out.
    pub fn scan_paths(&self, paths: &BTreeSet<String>) -> Vec<ScannedFile> {
        paths
            .iter()
            .filter(|p| {
                !Path::new(p.as_str())
                    .components()
                    .any(|c| self.is_excluded(&c.as_os_str().to_string_lossy()))
            })
            .filter_map(|p| self.scanned(&self.repo_root.join(p)))
            .collect()
    }

    /// Whether a repository-relative path falls inside the scan, judged by
    /// name alone. The file need not exist.
    pub fn covers(&self, path: &str) -> bool {
        let path = Path::new(path);
        if path
            .components()
            .any(|c| self.is_excluded(&c.as_os_str().to_string_lossy()))
        {
            return false;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        self.config.extensions.iter().any(|e| e == ext)
    }

    pub fn max_files(&self) -> Option<usize> {
        self.config.max_files
    }

    fn scanned(&self, full_path: &Path) -> Option<ScannedFile> {
        if !self.matches(full_path) {
            return None;
        }
        let metadata = fs::metadata(full_path).ok()?;
        let rel_path = full_path.strip_prefix(&self.repo_root).unwrap_or(full_path);
        let extension = full_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();

        Some(ScannedFile {
            path: rel_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            size: metadata.len(),
            extension,
        })
    }

    /// Check if a file matches scan criteria.
    pub fn matches(&self, path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if self.is_excluded(name) {
                return false;
            }
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.config.extensions.iter().any(|e| e == ext) {
            return false;
        }

        match fs::metadata(path) {
            Ok(metadata) => {
                metadata.is_file() && metadata.len() <= self.config.max_file_size as u64
            }
            Err(_) => false,
        }
    }

    fn is_excluded_entry(&self, entry: &DirEntry) -> bool {
        self.is_excluded(&entry.file_name().to_string_lossy())
    }

    /// Check if a name matches exclusion patterns.
    fn is_excluded(&self, name: &str) -> bool {
        // Hidden files
        if name.starts_with('.') && name != "." && name != ".." {
            return true;
        }

        self.config.excludes.iter().any(|pattern| name == pattern)
    }
}

/// Candidates read from a checked-out working tree.
pub struct WorkingTreeSource {
    scanner: FileScanner,
    commit_id: String,
    commit_timestamp: DateTime<Utc>,
}

impl WorkingTreeSource {
    pub fn new(
        scanner: FileScanner,
        commit_id: impl Into<String>,
        commit_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            scanner,
            commit_id: commit_id.into(),
            commit_timestamp,
        }
    }

    pub fn scanner(&self) -> &FileScanner {
        &self.scanner
    }

    fn read(&self, file: ScannedFile) -> Option<AnalysisCandidate> {
        let full_path = self.scanner.root().join(&file.path);
        match fs::read_to_string(&full_path) {
            Ok(content) => Some(AnalysisCandidate::new(
                content,
                detect_language(&file.extension),
                file.path,
                self.commit_id.clone(),
                self.commit_timestamp,
            )),
            Err(e) => {
                warn!("Failed to read {}: {}", file.path, e);
                None
            }
        }
    }
}

impl CandidateSource for WorkingTreeSource {
    fn extract(&self, only: Option<&BTreeSet<String>>) -> Result<Vec<AnalysisCandidate>> {
        let files = match only {
            Some(paths) => self.scanner.scan_paths(paths),
            None => self.scanner.scan()?,
        };
        Ok(files.into_iter().filter_map(|f| self.read(f)).collect())
    }

    fn file_limit(&self) -> Option<usize> {
        self.scanner.max_files()
    }
}
