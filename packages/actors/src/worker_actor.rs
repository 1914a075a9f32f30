//! Worker actor for executing jobs.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use jobs_core::{Job, JobType};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::handler::{HandlerFuture, JobContext, JobHandler};
use crate::messages::{JobOutcome, QueueMessage, WorkerMessage};

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    pub job_type: JobType,
    handler: Arc<dyn JobHandler>,
    timeout: Duration,
    /// Queue actor reference.
    queue: ActorRef<QueueMessage>,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub job_type: JobType,
    pub handler: Arc<dyn JobHandler>,
    /// Upper bound on one handler invocation.
    pub timeout: Duration,
    pub queue: ActorRef<QueueMessage>,
}

/// Worker actor that executes one job at a time for a single job type.
pub struct WorkerActor;

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a handler with a timeout, turning panics and timeouts into
/// retryable failures.
async fn execute(handler: &dyn JobHandler, job: &Job, ctx: JobContext) -> JobOutcome {
    let timeout = ctx.timeout;

    let future: HandlerFuture = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(job, ctx))) {
        Ok(future) => future,
        Err(panic) => {
            return JobOutcome::Failed {
                error: format!("handler panicked: {}", panic_message(panic.as_ref())),
                retryable: true,
            };
        }
    };

    match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await {
        Ok(Ok(Ok(result))) => JobOutcome::Completed(result),
        Ok(Ok(Err(error))) => JobOutcome::Failed {
            retryable: error.is_retryable(),
            error: error.to_string(),
        },
        Ok(Err(panic)) => JobOutcome::Failed {
            error: format!("handler panicked: {}", panic_message(panic.as_ref())),
            retryable: true,
        },
        Err(_) => JobOutcome::Failed {
            error: format!("timed out after {}ms", timeout.as_millis()),
            retryable: true,
        },
    }
}

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(worker_id = %args.worker_id, job_type = %args.job_type, "Starting worker");

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            job_type: args.job_type,
            handler: args.handler,
            timeout: args.timeout,
            queue: args.queue,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Process { job } => {
                let ctx = JobContext::new(&job, state.worker_id.clone(), state.timeout);
                let started = Instant::now();

                let outcome = execute(state.handler.as_ref(), &job, ctx).await;
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                match &outcome {
                    JobOutcome::Completed(result) => tracing::debug!(
                        job_id = %job.id,
                        worker_id = %state.worker_id,
                        duration_ms,
                        summary = %result.summary,
                        "Handler finished"
                    ),
                    JobOutcome::Failed { error, retryable } => tracing::debug!(
                        job_id = %job.id,
                        worker_id = %state.worker_id,
                        duration_ms,
                        retryable,
                        error = %error,
                        "Handler failed"
                    ),
                }

                state.queue.send_message(QueueMessage::JobFinished {
                    worker_id: state.worker_id.clone(),
                    job,
                    outcome,
                    duration_ms,
                })?;
            }
        }

        Ok(())
    }
}
