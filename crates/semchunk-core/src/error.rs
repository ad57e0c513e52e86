//! Error types for Semchunk.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Semchunk error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected input: unknown chunk type, empty content, malformed vector.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding length differs from the store dimensionality.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Fewer results than requested survived filtering.
    ///
    /// This is a soft signal; callers that accept partial results should use
    /// the `QueryResult` directly instead of converting it.
    #[error("Insufficient results: requested {requested}, found {found}")]
    InsufficientResults { requested: usize, found: usize },

    /// Vector index and chunk rows disagree.
    #[error("Index inconsistency: {0}")]
    IndexInconsistency(String),

    /// Embedding error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::Io(_) | Error::IndexInconsistency(_) | Error::Embedding(_) => true,
            _ => false,
        }
    }

    pub(crate) fn not_found_chunk(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("chunk {}", id))
    }
}
