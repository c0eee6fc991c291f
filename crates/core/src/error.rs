//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the queue engine.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Failed job executions are not errors: they are absorbed into job state by
/// the retry policy. Claim conflicts are not errors either; the claim loop
/// consumes them by reselecting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A job payload or argument failed validation. Nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced job, worker or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The job is not in the state the operation requires. Nothing was mutated.
    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// A job with the same id was already enqueued.
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// A configuration value could not be interpreted.
    #[error("invalid config: {0}")]
    Config(String),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn invalid_state(job_id: JobId, expected: JobStatus, actual: JobStatus) -> Self {
        Self::InvalidState {
            job_id,
            expected,
            actual,
        }
    }
}
