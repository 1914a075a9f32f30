//! Delayed and recurring job creation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{Job, JobKind, Priority, QueueName, Recurring, SchedulerConfig};
use jobs_db::{DbError, JobRepository};

use crate::handler::HandlerRegistry;

/// `at + by`, saturating at the largest representable time.
pub(crate) fn after(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Creates one-shot jobs at absolute times and keeps exactly one live
/// occurrence of every recurring job of a queue.
pub struct Trigger {
    queue: QueueName,
    recurring: Vec<Recurring>,
    default_priority: Priority,
    jobs: JobRepository,
    handlers: Arc<HandlerRegistry>,
}

impl Trigger {
    pub fn new(
        queue: QueueName,
        config: &SchedulerConfig,
        jobs: JobRepository,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            queue,
            recurring: config.recurring_for(queue).cloned().collect(),
            default_priority: config.queue(queue).default_priority,
            jobs,
            handlers,
        }
    }

    pub fn recurring(&self) -> &[Recurring] {
        &self.recurring
    }

    fn occurrence(&self, entry: &Recurring, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        let policy = self.handlers.policy(entry.kind.job_type());
        Job::new(entry.kind.clone(), now)
            .with_priority(entry.priority)
            .with_max_attempts(policy.max_attempts)
            .with_run_at(run_at, now)
            .with_dedupe_key(entry.dedupe_key())
    }

    /// Enqueue the next occurrence of every recurring entry that has none
    /// live. Returns the jobs created.
    pub async fn ensure(&self, now: DateTime<Utc>) -> Result<Vec<Job>, DbError> {
        let mut created = Vec::new();

        for entry in &self.recurring {
            let job = self.occurrence(entry, after(now, entry.every), now);
            let (job, is_new) = self.jobs.create_unique(&job).await?;
            if is_new {
                tracing::debug!(
                    queue = %self.queue,
                    name = %entry.name,
                    job_id = %job.id,
                    run_at = %job.run_at,
                    "Scheduled recurring job"
                );
                created.push(job);
            }
        }

        Ok(created)
    }

    /// Enqueue the occurrence following `finished`, measured from its
    /// finish time. Returns `None` for jobs that are not recurring.
    pub async fn reschedule(&self, finished: &Job, now: DateTime<Utc>) -> Result<Option<Job>, DbError> {
        let Some(key) = finished.dedupe_key.as_deref() else {
            return Ok(None);
        };
        let Some(entry) = self.recurring.iter().find(|entry| entry.dedupe_key() == key) else {
            return Ok(None);
        };

        let base = finished.finished_at.unwrap_or(now);
        let job = self.occurrence(entry, after(base, entry.every), now);
        let (job, is_new) = self.jobs.create_unique(&job).await?;

        Ok(is_new.then_some(job))
    }

    /// Store a one-shot job that becomes eligible at `at`.
    pub async fn schedule_at(
        &self,
        kind: JobKind,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, DbError> {
        let policy = self.handlers.policy(kind.job_type());
        let job = Job::new(kind, now)
            .with_priority(self.default_priority)
            .with_max_attempts(policy.max_attempts)
            .with_run_at(at, now);

        self.jobs.create(&job).await
    }
}
