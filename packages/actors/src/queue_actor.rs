//! Queue actor: the scheduler for a single queue.
//!
//! Each tick promotes due delayed jobs, reclaims stale claims, tops up
//! recurring jobs, claims eligible jobs for idle workers and applies
//! retention. All job state lives in the store; the actor only tracks which
//! of its own workers are busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use jobs_core::{
    Clock, EnqueueOptions, Job, JobEvent, JobId, JobKind, JobState, JobType, QueueConfig,
    QueueError, QueueName, QueueResult, QueueState, QueueStats, SchedulerConfig,
};
use jobs_db::{ClaimRequest, Database, FailureReport, JobRepository, QueueRepository, RetryOutcome};
use ractor::{Actor, ActorProcessingErr, ActorRef, ActorStatus, SupervisionEvent};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use crate::handler::HandlerRegistry;
use crate::messages::{JobOutcome, QueueMessage, TickReport, WorkerMessage};
use crate::trigger::{Trigger, after};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Queue actor arguments.
pub struct QueueActorArgs {
    pub queue: QueueName,
    pub scheduler: Arc<SchedulerConfig>,
    pub handlers: Arc<HandlerRegistry>,
    pub db: Database,
    pub clock: Arc<dyn Clock>,
    pub events: broadcast::Sender<JobEvent>,
}

struct WorkerSlot {
    worker_id: String,
    job_type: JobType,
    actor: ActorRef<WorkerMessage>,
    busy: bool,
}

/// State for the queue actor.
pub struct QueueActorState {
    queue: QueueName,
    config: QueueConfig,
    max_manual_retries: u32,
    queue_state: QueueState,
    handlers: Arc<HandlerRegistry>,
    jobs: JobRepository,
    queues: QueueRepository,
    trigger: Trigger,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<JobEvent>,
    workers: Vec<WorkerSlot>,
    /// Worker counter for unique IDs.
    worker_counter: u64,
    /// Set while a timer tick sits in the mailbox.
    timer_tick_queued: Arc<AtomicBool>,
}

impl QueueActorState {
    fn new(args: QueueActorArgs) -> Self {
        let jobs = JobRepository::new(args.db.clone());
        let trigger = Trigger::new(args.queue, &args.scheduler, jobs.clone(), args.handlers.clone());

        Self {
            queue: args.queue,
            config: args.scheduler.queue(args.queue),
            max_manual_retries: args.scheduler.max_manual_retries,
            queue_state: QueueState::Running,
            handlers: args.handlers,
            jobs,
            queues: QueueRepository::new(args.db),
            trigger,
            clock: args.clock,
            events: args.events,
            workers: Vec::new(),
            worker_counter: 0,
            timer_tick_queued: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Broadcast an event. Having no subscribers is not an error.
    fn broadcast(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn next_worker_id(&mut self, job_type: JobType) -> String {
        self.worker_counter += 1;
        format!("{}-{}-{}", self.queue, job_type, self.worker_counter)
    }

    async fn spawn_worker(
        &mut self,
        myself: &ActorRef<QueueMessage>,
        job_type: JobType,
    ) -> Option<WorkerSlot> {
        let handler = self.handlers.get(job_type)?;
        let worker_id = self.next_worker_id(job_type);
        let args = WorkerArgs {
            worker_id: worker_id.clone(),
            job_type,
            handler,
            timeout: self.handlers.policy(job_type).timeout,
            queue: myself.clone(),
        };

        match Actor::spawn_linked(None, WorkerActor, args, myself.get_cell()).await {
            Ok((actor, _handle)) => Some(WorkerSlot {
                worker_id,
                job_type,
                actor,
                busy: false,
            }),
            Err(e) => {
                tracing::error!(queue = %self.queue, %worker_id, "Failed to spawn worker: {}", e);
                None
            }
        }
    }

    /// Worker pool per registered job type, sized to the type's ceiling.
    async fn spawn_workers(&mut self, myself: &ActorRef<QueueMessage>) {
        for job_type in self.handlers.types_for(self.queue) {
            let ceiling = self.handlers.policy(job_type).ceiling;
            for _ in 0..ceiling {
                if let Some(slot) = self.spawn_worker(myself, job_type).await {
                    self.workers.push(slot);
                }
            }
            tracing::debug!(queue = %self.queue, %job_type, ceiling, "Worker pool started");
        }
    }

    async fn schedule_recurring(&mut self, report: &mut TickReport) {
        let now = self.clock.now();
        match self.trigger.ensure(now).await {
            Ok(created) => {
                report.scheduled = created.len();
                for job in created {
                    self.broadcast(JobEvent::JobEnqueued { job, timestamp: now });
                }
            }
            Err(e) => tracing::warn!(queue = %self.queue, "Failed to schedule recurring jobs: {}", e),
        }
    }

    /// One scheduling pass.
    async fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport {
            queue: Some(self.queue),
            ..Default::default()
        };

        match self.jobs.promote_due(self.queue, now).await {
            Ok(promoted) => {
                report.promoted = promoted.len();
                for job in promoted {
                    self.broadcast(JobEvent::JobPromoted {
                        job_id: job.id,
                        queue: self.queue,
                        timestamp: now,
                    });
                }
            }
            Err(e) => tracing::warn!(queue = %self.queue, "Failed to promote delayed jobs: {}", e),
        }

        match self.jobs.reclaim_stale(self.queue, now).await {
            Ok(reclaimed) => {
                report.reclaimed = reclaimed.len();
                for stale in reclaimed {
                    let job = stale.job;
                    tracing::warn!(
                        queue = %self.queue,
                        job_id = %job.id,
                        job_type = %job.job_type(),
                        worker_id = %stale.worker_id,
                        attempts = job.attempts,
                        new_state = %job.state,
                        "Reclaimed stale claim"
                    );
                    self.broadcast(JobEvent::JobReclaimed {
                        job_id: job.id,
                        queue: self.queue,
                        worker_id: stale.worker_id,
                        new_state: job.state,
                        timestamp: now,
                    });
                    if job.state == JobState::Failed {
                        self.broadcast(JobEvent::JobFailed {
                            job_id: job.id,
                            queue: self.queue,
                            job_type: job.job_type(),
                            error: job.last_error.clone().unwrap_or_default(),
                            attempts: job.attempts,
                            timestamp: now,
                        });
                        self.after_terminal(&job).await;
                    }
                }
            }
            Err(e) => tracing::warn!(queue = %self.queue, "Failed to reclaim stale claims: {}", e),
        }

        self.schedule_recurring(&mut report).await;

        if self.queue_state == QueueState::Paused {
            report.paused = true;
        } else {
            self.dispatch(&mut report).await;
        }

        let keep = self.config.retention.keep();
        for state in [JobState::Completed, JobState::Failed] {
            match self.jobs.trim_terminal(self.queue, state, keep).await {
                Ok(trimmed) => report.trimmed += trimmed,
                Err(e) => tracing::warn!(queue = %self.queue, %state, "Failed to apply retention: {}", e),
            }
        }

        if report.promoted + report.reclaimed + report.dispatched.len() > 0 || report.trimmed > 0 {
            tracing::debug!(
                queue = %self.queue,
                promoted = report.promoted,
                reclaimed = report.reclaimed,
                scheduled = report.scheduled,
                dispatched = report.dispatched.len(),
                trimmed = report.trimmed,
                "Tick"
            );
        }

        report
    }

    /// Claim eligible jobs for idle workers, highest priority first.
    async fn dispatch(&mut self, report: &mut TickReport) {
        let now = self.clock.now();

        for job_type in self.handlers.types_for(self.queue) {
            let policy = self.handlers.policy(job_type);
            let lease = policy.timeout.saturating_add(self.config.stale_grace);

            while let Some(idx) = self
                .workers
                .iter()
                .position(|w| w.job_type == job_type && !w.busy)
            {
                let request = ClaimRequest {
                    queue: self.queue,
                    job_type,
                    worker_id: self.workers[idx].worker_id.clone(),
                    ceiling: policy.ceiling,
                    lease,
                    now,
                };

                let job = match self.jobs.claim_next(&request).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(queue = %self.queue, %job_type, "Failed to claim job: {}", e);
                        break;
                    }
                };

                let slot = &mut self.workers[idx];
                let worker_id = slot.worker_id.clone();
                let (job_id, attempt) = (job.id, job.attempts);

                if let Err(e) = slot.actor.send_message(WorkerMessage::Process { job: Box::new(job) }) {
                    // The claim expires and the job is reclaimed.
                    tracing::warn!(queue = %self.queue, %job_id, %worker_id, "Failed to hand job to worker: {}", e);
                    break;
                }
                slot.busy = true;

                tracing::info!(queue = %self.queue, %job_id, %job_type, %worker_id, attempt, "Job started");
                self.broadcast(JobEvent::JobStarted {
                    job_id,
                    queue: self.queue,
                    job_type,
                    worker_id,
                    attempt,
                    timestamp: now,
                });
                report.dispatched.push(job_id);
            }
        }
    }

    /// Record a worker's outcome. Reports for claims that were reclaimed
    /// in the meantime are rejected by the store and only logged.
    async fn finish(&mut self, worker_id: &str, job: Job, outcome: JobOutcome, duration_ms: u64) {
        if let Some(slot) = self.workers.iter_mut().find(|w| w.worker_id == worker_id) {
            slot.busy = false;
        }

        let Some(claim) = job.claim.as_ref().map(|c| c.token) else {
            tracing::warn!(job_id = %job.id, %worker_id, "Outcome reported for a job without a claim");
            return;
        };

        let now = self.clock.now();
        let job_type = job.job_type();

        match outcome {
            JobOutcome::Completed(result) => match self.jobs.complete(job.id, claim, now).await {
                Ok(Some(done)) => {
                    tracing::info!(queue = %self.queue, job_id = %done.id, %job_type, duration_ms, "Job completed");
                    self.broadcast(JobEvent::JobCompleted {
                        job_id: done.id,
                        queue: self.queue,
                        job_type,
                        duration_ms,
                        result,
                        timestamp: now,
                    });
                    self.after_terminal(&done).await;
                }
                Ok(None) => tracing::warn!(job_id = %job.id, %worker_id, "Rejected completion for a stale claim"),
                Err(e) => tracing::warn!(job_id = %job.id, "Failed to record completion: {}", e),
            },
            JobOutcome::Failed { error, retryable } => {
                let backoff = self.handlers.policy(job_type).backoff;
                let retry_at = (retryable && job.has_attempts_left())
                    .then(|| after(now, backoff.delay(job.attempts)));
                let report = FailureReport {
                    job_id: job.id,
                    claim,
                    error: error.clone(),
                    retry_at,
                    now,
                };

                match self.jobs.fail(&report).await {
                    Ok(Some(updated)) if updated.state == JobState::Delayed => {
                        tracing::info!(
                            queue = %self.queue,
                            job_id = %updated.id,
                            %job_type,
                            attempts = updated.attempts,
                            run_at = %updated.run_at,
                            error = %error,
                            "Job will be retried"
                        );
                        self.broadcast(JobEvent::JobRetrying {
                            job_id: updated.id,
                            queue: self.queue,
                            error,
                            attempts: updated.attempts,
                            run_at: updated.run_at,
                            timestamp: now,
                        });
                    }
                    Ok(Some(failed)) => {
                        tracing::warn!(
                            queue = %self.queue,
                            job_id = %failed.id,
                            %job_type,
                            attempts = failed.attempts,
                            error = %error,
                            "Job failed"
                        );
                        self.broadcast(JobEvent::JobFailed {
                            job_id: failed.id,
                            queue: self.queue,
                            job_type,
                            error,
                            attempts: failed.attempts,
                            timestamp: now,
                        });
                        self.after_terminal(&failed).await;
                    }
                    Ok(None) => tracing::warn!(job_id = %job.id, %worker_id, "Rejected failure for a stale claim"),
                    Err(e) => tracing::warn!(job_id = %job.id, "Failed to record failure: {}", e),
                }
            }
        }
    }

    /// Queue the next occurrence of a finished recurring job.
    async fn after_terminal(&self, job: &Job) {
        let now = self.clock.now();
        match self.trigger.reschedule(job, now).await {
            Ok(Some(next)) => {
                tracing::debug!(queue = %self.queue, job_id = %next.id, run_at = %next.run_at, "Next occurrence scheduled");
                self.broadcast(JobEvent::JobEnqueued { job: next, timestamp: now });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(job_id = %job.id, "Failed to schedule next occurrence: {}", e),
        }
    }

    async fn enqueue(
        &self,
        kind: JobKind,
        options: EnqueueOptions,
        dedupe_key: Option<String>,
    ) -> QueueResult<JobId> {
        kind.validate()?;
        if kind.queue() != self.queue {
            return Err(QueueError::InvalidPayload(format!(
                "{} jobs belong to queue {}",
                kind.job_type(),
                kind.queue()
            )));
        }

        let now = self.clock.now();
        let policy = self.handlers.policy(kind.job_type());
        let job = Job::from_options(
            kind,
            &options,
            self.config.default_priority,
            policy.max_attempts,
            now,
        );

        let (job, created) = match dedupe_key {
            Some(key) => self.jobs.create_unique(&job.with_dedupe_key(key)).await?,
            None => (self.jobs.create(&job).await?, true),
        };

        if created {
            tracing::info!(
                queue = %self.queue,
                job_id = %job.id,
                job_type = %job.job_type(),
                state = %job.state,
                priority = %job.priority,
                "Job enqueued"
            );
            let id = job.id;
            self.broadcast(JobEvent::JobEnqueued { job, timestamp: now });
            Ok(id)
        } else {
            tracing::debug!(queue = %self.queue, job_id = %job.id, "Duplicate enqueue returned live job");
            Ok(job.id)
        }
    }

    async fn schedule_at(&self, kind: JobKind, at: chrono::DateTime<chrono::Utc>) -> QueueResult<JobId> {
        kind.validate()?;
        let now = self.clock.now();
        let job = self.trigger.schedule_at(kind, at, now).await?;

        tracing::info!(queue = %self.queue, job_id = %job.id, run_at = %job.run_at, "Job scheduled");
        let id = job.id;
        self.broadcast(JobEvent::JobEnqueued { job, timestamp: now });
        Ok(id)
    }

    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        match self.jobs.cancel(job_id).await? {
            Some(job) => {
                tracing::info!(queue = %self.queue, %job_id, state = %job.state, "Job cancelled");
                self.broadcast(JobEvent::JobCancelled {
                    job_id,
                    queue: self.queue,
                    timestamp: self.clock.now(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn retry(&self, job_id: JobId) -> QueueResult<Job> {
        let now = self.clock.now();
        match self.jobs.retry_failed(job_id, self.max_manual_retries, now).await? {
            RetryOutcome::Retried(job) => {
                tracing::info!(queue = %self.queue, %job_id, manual_retries = job.manual_retries, "Job retried by operator");
                self.broadcast(JobEvent::JobEnqueued {
                    job: job.clone(),
                    timestamp: now,
                });
                Ok(job)
            }
            RetryOutcome::NotFound => Err(QueueError::JobNotFound(job_id)),
            RetryOutcome::NotFailed(from) => Err(QueueError::InvalidTransition {
                job_id,
                from,
                to: JobState::Waiting,
            }),
            RetryOutcome::LimitReached => Err(QueueError::RetryLimitReached(job_id)),
            RetryOutcome::KeyInUse(holder) => Err(QueueError::DedupeKeyInUse { job_id, holder }),
        }
    }

    async fn purge(&self, state: JobState) -> QueueResult<u64> {
        if !state.is_terminal() {
            return Err(QueueError::Unsupported(format!("cannot purge {} jobs", state)));
        }

        let count = self.jobs.trim_terminal(self.queue, state, 0).await?;
        tracing::info!(queue = %self.queue, %state, count, "Purged jobs");
        self.broadcast(JobEvent::JobsPurged {
            queue: self.queue,
            state,
            count,
            timestamp: self.clock.now(),
        });
        Ok(count)
    }

    async fn set_state(&mut self, new_state: QueueState) -> QueueResult<()> {
        let now = self.clock.now();
        let old_state = self.queues.set_state(self.queue, new_state, now).await?;
        self.queue_state = new_state;

        if old_state != new_state {
            tracing::info!(queue = %self.queue, %old_state, %new_state, "Queue state changed");
            self.broadcast(JobEvent::QueueStateChanged {
                queue: self.queue,
                old_state,
                new_state,
                timestamp: now,
            });
        }
        Ok(())
    }
}

/// Queue actor that schedules a single queue.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue actor: {}", args.queue);

        let mut state = QueueActorState::new(args);

        match state.queues.ensure(state.queue, state.clock.now()).await {
            Ok(queue_state) => state.queue_state = queue_state,
            Err(e) => tracing::warn!(queue = %state.queue, "Failed to load queue state: {}", e),
        }

        state.spawn_workers(&myself).await;

        let mut report = TickReport::default();
        state.schedule_recurring(&mut report).await;

        // Start periodic tick. A slow pass skips timer ticks rather than
        // letting them pile up behind it.
        let interval = state.config.tick_interval.max(std::time::Duration::from_millis(1));
        let queued = state.timer_tick_queued.clone();
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if queued.swap(true, Ordering::AcqRel) {
                    if matches!(
                        myself_clone.get_status(),
                        ActorStatus::Stopping | ActorStatus::Stopped
                    ) {
                        break;
                    }
                    continue;
                }
                if myself_clone
                    .send_message(QueueMessage::Tick { reply: None })
                    .is_err()
                {
                    break;
                }
            }
        });

        tracing::info!(
            queue = %state.queue,
            state = %state.queue_state,
            workers = state.workers.len(),
            recurring = state.trigger.recurring().len(),
            tick_ms = interval.as_millis() as u64,
            "Queue actor started"
        );

        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue {
                kind,
                options,
                dedupe_key,
                reply,
            } => {
                let _ = reply.send(state.enqueue(kind, options, dedupe_key).await);
            }

            QueueMessage::ScheduleAt { kind, at, reply } => {
                let _ = reply.send(state.schedule_at(kind, at).await);
            }

            QueueMessage::Cancel { job_id, reply } => {
                let _ = reply.send(state.cancel(job_id).await);
            }

            QueueMessage::Retry { job_id, reply } => {
                let _ = reply.send(state.retry(job_id).await);
            }

            QueueMessage::Counts { reply } => {
                let stats = state
                    .jobs
                    .count_by_state(state.queue)
                    .await
                    .map(|counts| QueueStats::from_counts(&counts))
                    .map_err(QueueError::from);
                let _ = reply.send(stats);
            }

            QueueMessage::ListFailed { limit, reply } => {
                let failed = state
                    .jobs
                    .list_failed(state.queue, limit)
                    .await
                    .map_err(QueueError::from);
                let _ = reply.send(failed);
            }

            QueueMessage::Purge { state: job_state, reply } => {
                let _ = reply.send(state.purge(job_state).await);
            }

            QueueMessage::Pause { reply } => {
                let _ = reply.send(state.set_state(QueueState::Paused).await);
            }

            QueueMessage::Resume { reply } => {
                let _ = reply.send(state.set_state(QueueState::Running).await);
            }

            QueueMessage::Tick { reply } => {
                if reply.is_none() {
                    state.timer_tick_queued.store(false, Ordering::Release);
                }
                let report = state.tick().await;
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(report));
                }
            }

            QueueMessage::JobFinished {
                worker_id,
                job,
                outcome,
                duration_ms,
            } => {
                state.finish(&worker_id, *job, outcome, duration_ms).await;
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for slot in &state.workers {
            slot.actor.stop(Some("queue stopped".to_string()));
        }
        tracing::info!("Queue actor stopped: {}", state.queue);
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let SupervisionEvent::ActorFailed(cell, reason) = message {
            let Some(idx) = state
                .workers
                .iter()
                .position(|w| w.actor.get_id() == cell.get_id())
            else {
                return Ok(());
            };

            let dead = state.workers.remove(idx);
            tracing::error!(
                queue = %state.queue,
                worker_id = %dead.worker_id,
                "Worker failed, restarting: {}",
                reason
            );

            // Any job it held is reclaimed once its claim expires.
            if let Some(slot) = state.spawn_worker(&myself, dead.job_type).await {
                state.workers.push(slot);
            }
        }
        Ok(())
    }
}
