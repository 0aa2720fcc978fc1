//! Engine error types

use thiserror::Error;

/// Result type alias for engine operations
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Failures that abort a whole job (as opposed to per-row errors, which are
/// values flowing through the pipeline).
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] bulkport_lock::LockError),

    #[error("Transition refused: {0}")]
    Transition(#[from] TransitionError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bulkport error: {0}")]
    Common(#[from] bulkport_common::BulkportError),

    #[error("{0}")]
    Internal(String),
}

impl JobError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Refusals from the atomic status-transition primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("status is {actual}, expected {expected}")]
    WrongStatus { actual: String, expected: String },

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: String, to: String },
}
