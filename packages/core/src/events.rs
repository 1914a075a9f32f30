//! Events emitted by the scheduler for downstream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Job, JobId, JobResult, JobState, JobType, QueueName, QueueState};

/// Events emitted by the job queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A queue was paused or resumed.
    QueueStateChanged {
        queue: QueueName,
        old_state: QueueState,
        new_state: QueueState,
        timestamp: DateTime<Utc>,
    },
    /// Terminal records were removed.
    JobsPurged {
        queue: QueueName,
        state: JobState,
        count: u64,
        timestamp: DateTime<Utc>,
    },

    /// A new job was enqueued.
    JobEnqueued { job: Job, timestamp: DateTime<Utc> },
    /// A delayed job became eligible.
    JobPromoted {
        job_id: JobId,
        queue: QueueName,
        timestamp: DateTime<Utc>,
    },
    /// A job was claimed and handed to a worker.
    JobStarted {
        job_id: JobId,
        queue: QueueName,
        job_type: JobType,
        worker_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        queue: QueueName,
        job_type: JobType,
        duration_ms: u64,
        /// What the handler returned.
        result: JobResult,
        timestamp: DateTime<Utc>,
    },
    /// A job failed and was put back in `delayed` for another attempt.
    JobRetrying {
        job_id: JobId,
        queue: QueueName,
        error: String,
        attempts: u32,
        run_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A job failed permanently.
    JobFailed {
        job_id: JobId,
        queue: QueueName,
        job_type: JobType,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// A pending job was cancelled.
    JobCancelled {
        job_id: JobId,
        queue: QueueName,
        timestamp: DateTime<Utc>,
    },
    /// An active job whose claim expired was taken back.
    JobReclaimed {
        job_id: JobId,
        queue: QueueName,
        worker_id: String,
        new_state: JobState,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::QueueStateChanged { timestamp, .. } => *timestamp,
            JobEvent::JobsPurged { timestamp, .. } => *timestamp,
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobPromoted { timestamp, .. } => *timestamp,
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobRetrying { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::JobCancelled { timestamp, .. } => *timestamp,
            JobEvent::JobReclaimed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the queue associated with this event.
    pub fn queue(&self) -> QueueName {
        match self {
            JobEvent::QueueStateChanged { queue, .. } => *queue,
            JobEvent::JobsPurged { queue, .. } => *queue,
            JobEvent::JobEnqueued { job, .. } => job.queue,
            JobEvent::JobPromoted { queue, .. } => *queue,
            JobEvent::JobStarted { queue, .. } => *queue,
            JobEvent::JobCompleted { queue, .. } => *queue,
            JobEvent::JobRetrying { queue, .. } => *queue,
            JobEvent::JobFailed { queue, .. } => *queue,
            JobEvent::JobCancelled { queue, .. } => *queue,
            JobEvent::JobReclaimed { queue, .. } => *queue,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { job, .. } => Some(job.id),
            JobEvent::JobPromoted { job_id, .. } => Some(*job_id),
            JobEvent::JobStarted { job_id, .. } => Some(*job_id),
            JobEvent::JobCompleted { job_id, .. } => Some(*job_id),
            JobEvent::JobRetrying { job_id, .. } => Some(*job_id),
            JobEvent::JobFailed { job_id, .. } => Some(*job_id),
            JobEvent::JobCancelled { job_id, .. } => Some(*job_id),
            JobEvent::JobReclaimed { job_id, .. } => Some(*job_id),
            JobEvent::QueueStateChanged { .. } | JobEvent::JobsPurged { .. } => None,
        }
    }

    /// The state the job is in after this event, if the event moved one.
    pub fn job_state(&self) -> Option<JobState> {
        match self {
            JobEvent::JobEnqueued { job, .. } => Some(job.state),
            JobEvent::JobPromoted { .. } => Some(JobState::Waiting),
            JobEvent::JobStarted { .. } => Some(JobState::Active),
            JobEvent::JobCompleted { .. } => Some(JobState::Completed),
            JobEvent::JobRetrying { .. } => Some(JobState::Delayed),
            JobEvent::JobFailed { .. } => Some(JobState::Failed),
            JobEvent::JobReclaimed { new_state, .. } => Some(*new_state),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::QueueStateChanged {
                queue, new_state, ..
            } => format!("Queue {} -> {}", queue, new_state),
            JobEvent::JobsPurged {
                queue,
                state,
                count,
                ..
            } => format!("Queue {} purged {} {} jobs", queue, count, state),
            JobEvent::JobEnqueued { job, .. } => {
                format!("Job {} ({}) enqueued as {}", job.id, job.job_type(), job.state)
            }
            JobEvent::JobPromoted { job_id, .. } => format!("Job {} is due", job_id),
            JobEvent::JobStarted {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} started by {} (attempt {})", job_id, worker_id, attempt),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                result,
                ..
            } => format!("Job {} completed in {}ms: {}", job_id, duration_ms, result.summary),
            JobEvent::JobRetrying {
                job_id,
                error,
                run_at,
                ..
            } => format!("Job {} failed: {} (retry at {})", job_id, error, run_at),
            JobEvent::JobFailed {
                job_id,
                error,
                attempts,
                ..
            } => format!("Job {} failed after {} attempts: {}", job_id, attempts, error),
            JobEvent::JobCancelled { job_id, .. } => format!("Job {} cancelled", job_id),
            JobEvent::JobReclaimed {
                job_id,
                worker_id,
                new_state,
                ..
            } => format!(
                "Job {} reclaimed from {} -> {}",
                job_id, worker_id, new_state
            ),
        }
    }
}
