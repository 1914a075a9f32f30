//! Message types for actor communication.

use chrono::{DateTime, Utc};
use jobs_core::{
    EnqueueOptions, Job, JobId, JobKind, JobResult, JobState, QueueName, QueueResult, QueueStats,
};
use ractor::RpcReplyPort;
use serde::Serialize;

/// How a worker's execution of a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(JobResult),
    Failed { error: String, retryable: bool },
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub queue: Option<QueueName>,
    /// Delayed jobs that became waiting.
    pub promoted: usize,
    /// Stale claims taken back.
    pub reclaimed: usize,
    /// Recurring occurrences created.
    pub scheduled: usize,
    /// Jobs claimed and handed to workers, in dispatch order.
    pub dispatched: Vec<JobId>,
    /// Terminal records evicted by retention.
    pub trimmed: u64,
    /// Dispatch was skipped because the queue is paused.
    pub paused: bool,
}

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Enqueue a new job, deduplicated when a key is given.
    Enqueue {
        kind: JobKind,
        options: EnqueueOptions,
        dedupe_key: Option<String>,
        reply: RpcReplyPort<QueueResult<JobId>>,
    },

    /// Enqueue a one-shot job at an absolute time.
    ScheduleAt {
        kind: JobKind,
        at: DateTime<Utc>,
        reply: RpcReplyPort<QueueResult<JobId>>,
    },

    /// Cancel a pending job.
    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<QueueResult<bool>>,
    },

    /// Operator retry of a failed job.
    Retry {
        job_id: JobId,
        reply: RpcReplyPort<QueueResult<Job>>,
    },

    /// Job counts by state.
    Counts {
        reply: RpcReplyPort<QueueResult<QueueStats>>,
    },

    /// Most recent failures.
    ListFailed {
        limit: usize,
        reply: RpcReplyPort<QueueResult<Vec<Job>>>,
    },

    /// Delete every terminal record in `state`.
    Purge {
        state: JobState,
        reply: RpcReplyPort<QueueResult<u64>>,
    },

    /// Pause the queue.
    Pause { reply: RpcReplyPort<QueueResult<()>> },

    /// Resume the queue.
    Resume { reply: RpcReplyPort<QueueResult<()>> },

    /// Run a scheduling pass. Timer ticks carry no reply port.
    Tick {
        reply: Option<RpcReplyPort<QueueResult<TickReport>>>,
    },

    /// A worker finished executing a job.
    JobFinished {
        worker_id: String,
        job: Box<Job>,
        outcome: JobOutcome,
        duration_ms: u64,
    },
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Execute a claimed job and report back.
    Process { job: Box<Job> },
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    Enqueue {
        kind: JobKind,
        options: EnqueueOptions,
        dedupe_key: Option<String>,
        reply: RpcReplyPort<QueueResult<JobId>>,
    },

    ScheduleAt {
        kind: JobKind,
        at: DateTime<Utc>,
        reply: RpcReplyPort<QueueResult<JobId>>,
    },

    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<QueueResult<bool>>,
    },

    Retry {
        job_id: JobId,
        reply: RpcReplyPort<QueueResult<Job>>,
    },

    /// Get a job from any queue.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<QueueResult<Option<Job>>>,
    },

    Counts {
        queue: QueueName,
        reply: RpcReplyPort<QueueResult<QueueStats>>,
    },

    ListFailed {
        queue: QueueName,
        limit: usize,
        reply: RpcReplyPort<QueueResult<Vec<Job>>>,
    },

    Purge {
        queue: QueueName,
        state: JobState,
        reply: RpcReplyPort<QueueResult<u64>>,
    },

    Pause {
        queue: QueueName,
        reply: RpcReplyPort<QueueResult<()>>,
    },

    Resume {
        queue: QueueName,
        reply: RpcReplyPort<QueueResult<()>>,
    },

    /// Force an immediate scheduling pass.
    Tick {
        queue: QueueName,
        reply: RpcReplyPort<QueueResult<TickReport>>,
    },

    /// Shutdown all queues.
    Shutdown,
}
