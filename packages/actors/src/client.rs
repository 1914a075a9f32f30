//! Producer and operational handle over the supervisor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{
    Clock, EnqueueOptions, Job, JobEvent, JobId, JobKind, JobState, QueueError, QueueName,
    QueueResult, QueueStats, SchedulerConfig, SystemClock,
};
use jobs_db::Database;
use ractor::rpc::CallResult;
use ractor::{ActorRef, RpcReplyPort};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::handler::HandlerRegistry;
use crate::messages::{SupervisorMessage, TickReport};
use crate::supervisor::{SupervisorArgs, start_supervisor};

/// Capacity of the event channel. Lagging subscribers miss events rather
/// than slowing the scheduler.
const EVENT_CAPACITY: usize = 1024;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloneable handle used by producers and operational tooling.
#[derive(Clone)]
pub struct JobQueues {
    supervisor: ActorRef<SupervisorMessage>,
    events: broadcast::Sender<JobEvent>,
    call_timeout: Duration,
}

impl JobQueues {
    /// Start the scheduler on the wall clock.
    pub async fn start(
        db: Database,
        config: SchedulerConfig,
        handlers: Arc<HandlerRegistry>,
    ) -> QueueResult<(Self, JoinHandle<()>)> {
        Self::start_with_clock(db, config, handlers, Arc::new(SystemClock)).await
    }

    /// Start the scheduler with an explicit time source.
    pub async fn start_with_clock(
        db: Database,
        config: SchedulerConfig,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<(Self, JoinHandle<()>)> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let args = SupervisorArgs {
            db,
            config,
            handlers,
            clock,
            events: events.clone(),
        };

        let (supervisor, handle) = start_supervisor(args)
            .await
            .map_err(|e| QueueError::Actor(format!("Failed to start supervisor: {}", e)))?;

        Ok((
            Self {
                supervisor,
                events,
                call_timeout: DEFAULT_CALL_TIMEOUT,
            },
            handle,
        ))
    }

    /// Bound on how long a call waits for the scheduler's reply.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn call<T, F>(&self, build: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<QueueResult<T>>) -> SupervisorMessage,
    {
        match ractor::rpc::call(&self.supervisor, build, Some(self.call_timeout)).await {
            Ok(CallResult::Success(result)) => result,
            Ok(CallResult::Timeout) => Err(QueueError::Timeout),
            Ok(CallResult::SenderError) => Err(QueueError::Actor("request dropped".into())),
            Err(e) => Err(QueueError::Actor(e.to_string())),
        }
    }

    /// Durably store a new job. Returns once the record is written.
    pub async fn enqueue(&self, kind: JobKind, options: EnqueueOptions) -> QueueResult<JobId> {
        self.call(|reply| SupervisorMessage::Enqueue {
            kind,
            options,
            dedupe_key: None,
            reply,
        })
        .await
    }

    /// Like [`enqueue`](Self::enqueue), but returns the id of the live job
    /// already holding `dedupe_key` instead of creating a duplicate.
    pub async fn enqueue_unique(
        &self,
        kind: JobKind,
        dedupe_key: impl Into<String>,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let dedupe_key = Some(dedupe_key.into());
        self.call(|reply| SupervisorMessage::Enqueue {
            kind,
            options,
            dedupe_key,
            reply,
        })
        .await
    }

    /// Store a job that becomes eligible at the absolute time `at`.
    pub async fn schedule_at(&self, kind: JobKind, at: DateTime<Utc>) -> QueueResult<JobId> {
        self.call(|reply| SupervisorMessage::ScheduleAt { kind, at, reply })
            .await
    }

    /// Cancel a waiting or delayed job. Returns `false` if it was active,
    /// terminal or unknown.
    pub async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        self.call(|reply| SupervisorMessage::Cancel { job_id, reply })
            .await
    }

    /// Move a failed job back to waiting with a fresh attempt budget.
    pub async fn retry(&self, job_id: JobId) -> QueueResult<Job> {
        self.call(|reply| SupervisorMessage::Retry { job_id, reply })
            .await
    }

    pub async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.call(|reply| SupervisorMessage::GetJob { job_id, reply })
            .await
    }

    pub async fn counts(&self, queue: QueueName) -> QueueResult<QueueStats> {
        self.call(|reply| SupervisorMessage::Counts { queue, reply })
            .await
    }

    /// Most recently failed jobs with their last error, newest first.
    pub async fn failed(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        self.call(|reply| SupervisorMessage::ListFailed { queue, limit, reply })
            .await
    }

    /// Delete every completed or failed record of a queue.
    pub async fn purge(&self, queue: QueueName, state: JobState) -> QueueResult<u64> {
        self.call(|reply| SupervisorMessage::Purge {
            queue,
            state,
            reply,
        })
        .await
    }

    /// Stop dispatching from a queue. Enqueues are still accepted.
    pub async fn pause(&self, queue: QueueName) -> QueueResult<()> {
        self.call(|reply| SupervisorMessage::Pause { queue, reply })
            .await
    }

    pub async fn resume(&self, queue: QueueName) -> QueueResult<()> {
        self.call(|reply| SupervisorMessage::Resume { queue, reply })
            .await
    }

    /// Run a scheduling pass now instead of waiting for the next tick.
    pub async fn tick(&self, queue: QueueName) -> QueueResult<TickReport> {
        self.call(|reply| SupervisorMessage::Tick { queue, reply })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop every queue actor and the supervisor. Await the join handle
    /// returned by `start` to know when it is done.
    pub fn shutdown(&self) -> QueueResult<()> {
        self.supervisor
            .send_message(SupervisorMessage::Shutdown)
            .map_err(|e| QueueError::Actor(e.to_string()))
    }
}
