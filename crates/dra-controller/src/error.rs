//! Controller error types.

use dra_allocator::AllocationError;
use dra_core::StatusError;
use dra_store::StateError;
use thiserror::Error;

/// Errors that can occur while driving a claim.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("claim not found: {0}")]
    ClaimNotFound(String),

    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("status transition rejected: {0}")]
    Status(#[from] StatusError),

    /// A `NoExecute` taint on an allocated device is not tolerated.
    #[error("claim {key} has consumers scheduled for eviction at {deadline}")]
    EvictionScheduled { key: String, deadline: u64 },

    #[error("claim {key}: device {device} waits for {}", conditions.join(", "))]
    BindingPending {
        key: String,
        device: String,
        conditions: Vec<String>,
    },

    #[error("claim {key}: device {device} reported {condition}")]
    BindingFailed {
        key: String,
        device: String,
        condition: String,
    },

    #[error("claim {key}: gave up after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },
}

impl ControllerError {
    /// Whether re-queuing the same work may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Allocation(e) => e.is_retryable(),
            ControllerError::State(e) => e.is_retryable(),
            ControllerError::BindingPending { .. } | ControllerError::RetriesExhausted { .. } => true,
            _ => false,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
