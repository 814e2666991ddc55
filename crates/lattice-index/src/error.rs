//! Crate-wide error type.
//!
//! One taxonomy shared by every component: input problems are reported
//! immediately, backend outages are retryable, store failures are fatal to
//! the operation in progress. Per-file failures during an indexing run are
//! not errors at this level; the indexer records them in its stats instead.

use thiserror::Error;

/// Errors produced by the engine and its components.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed caller input (empty query, bad path, bad configuration).
    #[error("invalid input: {0}")]
    Input(String),

    /// The embedding backend is unreachable or not ready. Callers may
    /// retry with backoff.
    #[error("embedding backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backing store cannot be opened or queried. Fatal to the
    /// operation; at initialization, fatal to the session.
    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the caller may retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::BackendUnavailable(_))
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
