//! Storage-layer error type.

use thiserror::Error;

/// Failure talking to a persistence backend. Callers in `gateway` treat
/// this as "persistence unavailable" and, for the cache backend
/// specifically, fall back to in-process storage rather than
/// propagating it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relational backend error: {0}")]
    Relational(#[from] sqlx::Error),

    #[error("cache backend error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
