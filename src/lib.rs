//! YoInsight - ensemble code insight for git repositories.
//!
//! Source files are analyzed by every available model provider at once,
//! the answers are merged into one consensus result, results are cached by
//! content, and repeat runs over a repository only re-analyze the files
//! that changed since the last stored snapshot.

pub mod analysis;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod ensemble;
pub mod error;
pub mod incremental;
pub mod models;
pub mod providers;
pub mod repo;
pub mod report;
pub mod scanner;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;
