//! Repository access: cloning and revision history.

pub mod cloner;
pub mod history;

pub use cloner::{clone_repository, CloneOptions, CloneResult};
pub use history::{dirty_paths, head_commit, GitChangeDetector, HeadCommit};
