//! Error types for the analysis core.
//!
//! Provider, cache, snapshot and consensus failures are absorbed inside the
//! core and surface only as result metadata. [`AnalysisError`] is the one
//! type that reaches callers.

use std::time::Duration;

/// Failure of a single provider call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("timeout")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("failed to parse model response: {message}")]
    Parse { message: String, raw: String },
}

impl ProviderError {
    /// Text recorded on a failed `ModelResult`.
    ///
    /// Timeouts are always recorded as the literal `"timeout"`; parse errors
    /// keep the raw model reply so it can be inspected later.
    pub fn record(&self) -> String {
        match self {
            ProviderError::Timeout(_) => "timeout".to_string(),
            ProviderError::Parse { message, raw } => {
                format!("failed to parse model response: {} (raw: {})", message, raw)
            }
            other => other.to_string(),
        }
    }
}

/// Failure of the shared cache backend.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache value could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Failure reading or writing a repository snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot for {identity} is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure computing the change set between two revisions.
#[derive(Debug, thiserror::Error)]
pub enum ChangeError {
    #[error("revision not found: {0}")]
    UnknownRevision(String),

    #[error("source control error: {0}")]
    SourceControl(String),
}

impl From<git2::Error> for ChangeError {
    fn from(err: git2::Error) -> Self {
        ChangeError::SourceControl(err.message().to_string())
    }
}

/// Failure reducing provider results to a consensus.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsensusError {
    #[error("no successful results to reduce")]
    Empty,

    #[error("total weight is zero")]
    ZeroWeight,

    #[error("provider {0} reported a non-finite confidence")]
    InvalidConfidence(String),
}

/// Errors that propagate to callers of the coordinator.
///
/// These are programming errors (bad input), not runtime conditions.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("unsupported analysis kind: {0}")]
    UnsupportedKind(String),

    #[error("candidate {0} has no source text")]
    EmptyCandidate(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("candidate extraction failed: {0}")]
    Extraction(#[source] anyhow::Error),
}

/// Result type for coordinator operations.
pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_records_literal() {
        let err = ProviderError::Timeout(Duration::from_secs(3));
        assert_eq!(err.record(), "timeout");
    }

    #[test]
    fn test_parse_error_keeps_raw_text() {
        let err = ProviderError::Parse {
            message: "expected value".to_string(),
            raw: "not json at all".to_string(),
        };
        assert!(err.record().contains("not json at all"));
    }
}
