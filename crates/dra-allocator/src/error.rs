//! Error types for allocation.

use thiserror::Error;

use crate::selector::EvalError;

/// Result type alias for allocation.
pub type AllocResult<T> = Result<T, AllocationError>;

/// Why a claim could not be allocated.
///
/// Only [`AllocationError::Selector`] and [`AllocationError::InvalidClaim`]
/// are permanent. Everything else resolves once the catalog, the classes or
/// the free capacity change.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// A selector failed to evaluate or did not yield a boolean. The whole
    /// attempt is aborted.
    #[error("selector {expression:?} of request {request} failed: {source}")]
    Selector {
        request: String,
        expression: String,
        #[source]
        source: EvalError,
    },

    /// A pool the allocation might touch has not converged yet.
    #[error("pools not yet complete: {}", pools.join(", "))]
    Incomplete { pools: Vec<String> },

    #[error("insufficient resources for request {request}")]
    Insufficient { request: String },

    #[error("device class {class} not found")]
    ClassNotFound { class: String },

    #[error("claim cannot be allocated: {0}")]
    InvalidClaim(String),
}

impl AllocationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AllocationError::Incomplete { .. }
                | AllocationError::Insufficient { .. }
                | AllocationError::ClassNotFound { .. }
        )
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AllocationError::Selector { .. } => "selector",
            AllocationError::Incomplete { .. } => "incomplete",
            AllocationError::Insufficient { .. } => "insufficient",
            AllocationError::ClassNotFound { .. } => "class_not_found",
            AllocationError::InvalidClaim(_) => "invalid",
        }
    }
}
