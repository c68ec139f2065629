//! Error types for the object store.

use dra_core::ValidationErrors;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid object: {0}")]
    Invalid(#[from] ValidationErrors),

    #[error("invalid field selector: {0}")]
    InvalidSelector(String),

    /// The caller's base version is stale. Re-read and retry.
    #[error("conflict on {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
}

impl StateError {
    /// Version conflicts resolve on retry with fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}
