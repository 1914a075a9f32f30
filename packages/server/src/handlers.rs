//! Handlers installed by the server process.
//!
//! The business work behind each job type lives in the application
//! services; this process only records that a job ran.

use std::sync::Arc;

use jobs_actors::{FnHandler, HandlerError, HandlerRegistry, JobContext};
use jobs_core::{Job, JobResult, JobType};
use serde_json::json;

async fn log_job(job: Job, ctx: JobContext) -> Result<JobResult, HandlerError> {
    tracing::info!(
        job_id = %job.id,
        queue = %job.queue,
        job_type = %job.job_type(),
        attempt = ctx.attempt,
        worker_id = %ctx.worker_id,
        "Running job"
    );
    Ok(JobResult::with_output(
        format!("{} handled", job.job_type()),
        json!({ "attempt": ctx.attempt, "worker_id": ctx.worker_id }),
    ))
}

/// One handler per job type, each with its default policy.
pub fn registry() -> Arc<HandlerRegistry> {
    JobType::ALL
        .into_iter()
        .fold(HandlerRegistry::builder(), |builder, job_type| {
            builder.register(job_type, FnHandler::new(log_job))
        })
        .build()
}
