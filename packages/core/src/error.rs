//! Errors surfaced to producers and operators.

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Error type for queue operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Rejected at enqueue; no record was created.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {0} has used all of its manual retries")]
    RetryLimitReached(JobId),

    /// A retried job's dedupe key is held by another live job.
    #[error("Job {job_id} cannot be retried while job {holder} holds its dedupe key")]
    DedupeKeyInUse { job_id: JobId, holder: JobId },

    /// An operator request that does not apply, such as purging pending jobs.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
