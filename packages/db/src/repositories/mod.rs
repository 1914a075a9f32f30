//! Repository implementations for database operations.

mod job_repo;
mod queue_repo;

pub use job_repo::{
    ClaimRequest, FailureReport, JobRepository, Reclaimed, RetryOutcome,
    STALE_CLAIM_ERROR,
};
pub use queue_repo::QueueRepository;
