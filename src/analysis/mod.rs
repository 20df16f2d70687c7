//! Report statistics.
//!
//! Summaries are derived data: they are recomputed from the file map
//! whenever a report is built or merged, never patched in place.

pub mod aggregator;

pub use aggregator::*;
