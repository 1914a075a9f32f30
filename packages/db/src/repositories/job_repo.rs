//! Job repository: durable job records and their conditional transitions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{Claim, Job, JobId, JobKind, JobState, JobType, Priority, QueueName};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{Database, DbError};

/// Candidates fetched per claim attempt; later ones are tried if an earlier
/// one was taken by a concurrent scheduler.
const CLAIM_CANDIDATES: usize = 8;

/// Times a unique enqueue retries after losing a race on the dedupe lock.
const DEDUPE_ATTEMPTS: usize = 3;

/// A dedupe lock whose holder record is missing is only reclaimed once it is
/// older than this.
const ORPHAN_LOCK_GRACE_MS: i64 = 60_000;

pub const STALE_CLAIM_ERROR: &str = "stale claim expired";

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Storage shape of a job. Timestamps are epoch milliseconds so that
/// eligibility comparisons run inside the database.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    job_id: String,
    queue: String,
    job_type: String,
    payload: serde_json::Value,
    priority: i64,
    state: String,
    run_at: i64,
    attempts: i64,
    max_attempts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claim_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claimed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claim_expires_at: Option<i64>,
    #[serde(default)]
    manual_retries: i64,
    created_at: i64,
    updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<i64>,
}

/// Holder of a dedupe key.
#[derive(Debug, Serialize, Deserialize)]
struct DedupeRow {
    job_id: String,
    created_at: i64,
}

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(value: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| DbError::Serialization(format!("timestamp out of range: {}", value)))
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn to_u32(value: i64, field: &str) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::Serialization(format!("{} out of range: {}", field, value)))
}

impl JobRow {
    fn from_job(job: &Job) -> Result<Self, DbError> {
        let (job_type, payload) = job.kind.to_parts()?;
        Ok(Self {
            job_id: job.id.to_string(),
            queue: job.queue.as_str().to_string(),
            job_type: job_type.as_str().to_string(),
            payload,
            priority: i64::from(job.priority.value()),
            state: job.state.as_str().to_string(),
            run_at: ms(job.run_at),
            attempts: i64::from(job.attempts),
            max_attempts: i64::from(job.max_attempts),
            last_error: job.last_error.clone(),
            dedupe_key: job.dedupe_key.clone(),
            claim_token: job.claim.as_ref().map(|c| c.token.to_string()),
            worker_id: job.claim.as_ref().map(|c| c.worker_id.clone()),
            claimed_at: job.claim.as_ref().map(|c| ms(c.claimed_at)),
            claim_expires_at: job.claim.as_ref().map(|c| ms(c.expires_at)),
            manual_retries: i64::from(job.manual_retries),
            created_at: ms(job.created_at),
            updated_at: ms(job.updated_at),
            finished_at: job.finished_at.map(ms),
        })
    }

    fn into_job(self) -> Result<Job, DbError> {
        let id = JobId::parse(&self.job_id)
            .map_err(|e| DbError::Serialization(format!("bad job id {}: {}", self.job_id, e)))?;
        let queue: QueueName = self.queue.parse().map_err(DbError::Serialization)?;
        let job_type: JobType = self.job_type.parse().map_err(DbError::Serialization)?;
        let kind = JobKind::from_parts(job_type, self.payload)?;
        let state: JobState = self.state.parse().map_err(DbError::Serialization)?;
        let priority = u8::try_from(self.priority)
            .map(Priority)
            .map_err(|_| DbError::Serialization(format!("bad priority: {}", self.priority)))?;

        let claim = match (
            self.claim_token,
            self.worker_id,
            self.claimed_at,
            self.claim_expires_at,
        ) {
            (Some(token), Some(worker_id), Some(claimed_at), Some(expires_at)) => Some(Claim {
                token: Ulid::from_string(&token)
                    .map_err(|e| DbError::Serialization(format!("bad claim token: {}", e)))?,
                worker_id,
                claimed_at: from_ms(claimed_at)?,
                expires_at: from_ms(expires_at)?,
            }),
            _ => None,
        };

        Ok(Job {
            id,
            queue,
            kind,
            priority,
            state,
            run_at: from_ms(self.run_at)?,
            attempts: to_u32(self.attempts, "attempts")?,
            max_attempts: to_u32(self.max_attempts, "max_attempts")?,
            last_error: self.last_error,
            dedupe_key: self.dedupe_key,
            claim,
            manual_retries: to_u32(self.manual_retries, "manual_retries")?,
            created_at: from_ms(self.created_at)?,
            updated_at: from_ms(self.updated_at)?,
            finished_at: self.finished_at.map(from_ms).transpose()?,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, DbError> {
    rows.into_iter().map(JobRow::into_job).collect()
}

fn dedupe_lock_id(queue: QueueName, key: &str) -> String {
    format!("{}/{}", queue, key)
}

/// The job if an operator may retry it, otherwise the reason it may not.
fn retryable(job: Option<Job>, max_manual_retries: u32) -> Result<Job, RetryOutcome> {
    match job {
        None => Err(RetryOutcome::NotFound),
        Some(job) if job.state != JobState::Failed => Err(RetryOutcome::NotFailed(job.state)),
        Some(job) if job.manual_retries >= max_manual_retries => Err(RetryOutcome::LimitReached),
        Some(job) => Ok(job),
    }
}

/// Operator retry; fails the transaction if the job stopped being retryable.
const RETRY: &str = r#"
BEGIN TRANSACTION;
LET $retried = (
    UPDATE type::thing("job", $id)
    SET state = "waiting",
        attempts = 0,
        manual_retries += 1,
        run_at = $now_ms,
        finished_at = NONE,
        updated_at = $now_ms
    WHERE state = "failed" AND manual_retries < $max
    RETURN AFTER
);
IF array::len($retried) = 0 {
    THROW "job is no longer retryable";
};
COMMIT TRANSACTION;
"#;

/// As [`RETRY`], also taking the dedupe lock back. Creation fails if the
/// lock is held.
const RETRY_WITH_LOCK: &str = r#"
BEGIN TRANSACTION;
CREATE type::thing("job_dedupe", $lock_id) CONTENT $lock;
LET $retried = (
    UPDATE type::thing("job", $id)
    SET state = "waiting",
        attempts = 0,
        manual_retries += 1,
        run_at = $now_ms,
        finished_at = NONE,
        updated_at = $now_ms
    WHERE state = "failed" AND manual_retries < $max
    RETURN AFTER
);
IF array::len($retried) = 0 {
    THROW "job is no longer retryable";
};
COMMIT TRANSACTION;
"#;

/// Who currently holds a dedupe lock.
enum LockHolder {
    Free,
    Live(Job),
    /// The lock points at a job that does not exist and is still within its
    /// grace period.
    Orphan,
}

/// Parameters for claiming the next eligible job of one type.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub queue: QueueName,
    pub job_type: JobType,
    pub worker_id: String,
    /// Max active jobs of this type across every scheduler.
    pub ceiling: u32,
    /// Claim lifetime: handler timeout plus stale grace.
    pub lease: Duration,
    pub now: DateTime<Utc>,
}

/// A handler failure reported by the worker holding the claim.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub job_id: JobId,
    pub claim: Ulid,
    pub error: String,
    /// `Some` puts the job back in `delayed`; `None` fails it permanently.
    pub retry_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// A stale claim taken back from a worker that never reported.
#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub job: Job,
    pub worker_id: String,
}

/// Result of an operator retry.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Retried(Job),
    NotFound,
    NotFailed(JobState),
    LimitReached,
    /// Another live job holds the failed job's dedupe key.
    KeyInUse(JobId),
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new job in the database.
    pub async fn create(&self, job: &Job) -> Result<Job, DbError> {
        let row = JobRow::from_job(job)?;

        let record: Option<JobRow> = self
            .db
            .create(("job", job.id.to_string()))
            .content(row)
            .await?;

        record
            .ok_or_else(|| DbError::Query("Failed to create job".into()))?
            .into_job()
    }

    /// Create `job` unless a live job already holds its dedupe key.
    ///
    /// The lock row and the job row are written in one transaction, so a
    /// lock is never visible without its holder. Returns the stored job and
    /// whether it was newly created.
    pub async fn create_unique(&self, job: &Job) -> Result<(Job, bool), DbError> {
        let key = job
            .dedupe_key
            .as_deref()
            .ok_or_else(|| DbError::Query("unique enqueue without a dedupe key".into()))?;
        let lock_id = dedupe_lock_id(job.queue, key);
        let now_ms = ms(job.created_at);
        let mut last_error = None;

        for _ in 0..DEDUPE_ATTEMPTS {
            let row = JobRow::from_job(job)?;
            let lock = DedupeRow {
                job_id: job.id.to_string(),
                created_at: now_ms,
            };

            match self.insert_with_lock(row, lock, &lock_id).await {
                Ok(()) => return Ok((self.get(job.id).await?, true)),
                Err(e) => last_error = Some(e),
            }

            match self.inspect_lock(&lock_id, now_ms).await? {
                LockHolder::Live(existing) => return Ok((existing, false)),
                LockHolder::Free => {
                    tracing::debug!(key, "Lost dedupe lock race, retrying");
                }
                LockHolder::Orphan => {
                    return Err(DbError::Conflict(format!(
                        "dedupe key {} is held by a missing job",
                        key
                    )));
                }
            }
        }

        Err(DbError::Conflict(match last_error {
            Some(e) => format!("dedupe key {} is contended: {}", key, e),
            None => format!("dedupe key {} is contended", key),
        }))
    }

    async fn insert_with_lock(
        &self,
        row: JobRow,
        lock: DedupeRow,
        lock_id: &str,
    ) -> Result<(), surrealdb::Error> {
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                CREATE type::thing("job_dedupe", $lock_id) CONTENT $lock;
                CREATE type::thing("job", $job_id) CONTENT $row;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("lock_id", lock_id.to_string()))
            .bind(("lock", lock))
            .bind(("job_id", row.job_id.clone()))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    /// Look up the holder of a dedupe lock, releasing the lock if its holder
    /// finished or disappeared long enough ago.
    async fn inspect_lock(&self, lock_id: &str, now_ms: i64) -> Result<LockHolder, DbError> {
        let held: Option<DedupeRow> = self.db.select(("job_dedupe", lock_id.to_string())).await?;
        let Some(held) = held else {
            return Ok(LockHolder::Free);
        };

        let holder = match JobId::parse(&held.job_id) {
            Ok(holder_id) => self.find(holder_id).await?,
            Err(_) => None,
        };

        match holder {
            Some(existing) if existing.state.is_live() => Ok(LockHolder::Live(existing)),
            Some(_) => {
                self.release_dedupe_lock(lock_id, &held.job_id).await?;
                Ok(LockHolder::Free)
            }
            None if now_ms.saturating_sub(held.created_at) >= ORPHAN_LOCK_GRACE_MS => {
                tracing::warn!(lock = lock_id, holder = %held.job_id, "Releasing orphaned dedupe lock");
                self.release_dedupe_lock(lock_id, &held.job_id).await?;
                Ok(LockHolder::Free)
            }
            None => Ok(LockHolder::Orphan),
        }
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Get a job by ID, if it exists.
    pub async fn find(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRow> = self.db.select(("job", id.to_string())).await?;
        record.map(JobRow::into_job).transpose()
    }

    /// Most recently failed jobs of a queue, newest first.
    pub async fn list_failed(&self, queue: QueueName, limit: usize) -> Result<Vec<Job>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT * FROM job
                WHERE queue = $queue AND state = "failed"
                ORDER BY finished_at DESC
                LIMIT $limit
                "#,
            )
            .bind(("queue", queue.as_str()))
            .bind(("limit", limit as i64))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        into_jobs(rows)
    }

    /// Delete a pending job. Active and terminal jobs are left untouched.
    ///
    /// Returns the job as it was before deletion, or `None` if it was not
    /// pending.
    pub async fn cancel(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let Some(job) = self.find(id).await? else {
            return Ok(None);
        };
        if !job.state.is_pending() {
            return Ok(None);
        }

        let Some(key) = job.dedupe_key.as_deref() else {
            let mut response = self
                .db
                .query(
                    r#"
                    DELETE type::thing("job", $id)
                    WHERE state IN ["waiting", "delayed"]
                    RETURN BEFORE
                    "#,
                )
                .bind(("id", id.to_string()))
                .await?;

            let rows: Vec<JobRow> = response.take(0)?;
            return Ok(into_jobs(rows)?.into_iter().next());
        };

        // The job and its lock go together so the key is never held by a
        // deleted job.
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                LET $gone = (
                    DELETE type::thing("job", $id)
                    WHERE state IN ["waiting", "delayed"]
                    RETURN BEFORE
                );
                IF array::len($gone) > 0 {
                    DELETE type::thing("job_dedupe", $lock_id) WHERE job_id = $id;
                };
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("lock_id", dedupe_lock_id(job.queue, key)))
            .await?
            .check()?;

        match self.find(id).await? {
            None => Ok(Some(job)),
            Some(_) => Ok(None),
        }
    }

    /// Move delayed jobs whose `run_at` has elapsed to `waiting`.
    pub async fn promote_due(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Vec<Job>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE job
                SET state = "waiting", updated_at = $now_ms
                WHERE queue = $queue AND state = "delayed" AND run_at <= $now_ms
                RETURN AFTER
                "#,
            )
            .bind(("queue", queue.as_str()))
            .bind(("now_ms", ms(now)))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        into_jobs(rows)
    }

    /// Number of active jobs of one type in a queue.
    pub async fn active_count(&self, queue: QueueName, job_type: JobType) -> Result<u64, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT count() AS count FROM job
                WHERE queue = $queue AND job_type = $job_type AND state = "active"
                GROUP ALL
                "#,
            )
            .bind(("queue", queue.as_str()))
            .bind(("job_type", job_type.as_str()))
            .await?;

        #[derive(Deserialize)]
        struct CountResult {
            count: i64,
        }

        let counts: Vec<CountResult> = response.take(0)?;
        Ok(counts.first().map_or(0, |c| c.count.max(0) as u64))
    }

    /// Claim the highest-priority waiting job of one type.
    ///
    /// The claim is a single conditional update: it succeeds only if the row
    /// is still `waiting` and the type is below its ceiling at commit time.
    pub async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT * FROM job
                WHERE queue = $queue AND job_type = $job_type AND state = "waiting"
                ORDER BY priority ASC, created_at ASC, job_id ASC
                LIMIT $limit
                "#,
            )
            .bind(("queue", request.queue.as_str()))
            .bind(("job_type", request.job_type.as_str()))
            .bind(("limit", CLAIM_CANDIDATES as i64))
            .await?;

        let candidates: Vec<JobRow> = response.take(0)?;
        let now_ms = ms(request.now);
        let expires_ms = now_ms.saturating_add(duration_ms(request.lease));

        for candidate in candidates {
            let mut response = self
                .db
                .query(
                    r#"
                    UPDATE type::thing("job", $id)
                    SET state = "active",
                        attempts += 1,
                        claim_token = $claim,
                        worker_id = $worker_id,
                        claimed_at = $now_ms,
                        claim_expires_at = $expires_ms,
                        updated_at = $now_ms
                    WHERE state = "waiting"
                        AND array::len((
                            SELECT VALUE job_id FROM job
                            WHERE queue = $queue AND job_type = $job_type AND state = "active"
                        )) < $ceiling
                    RETURN AFTER
                    "#,
                )
                .bind(("id", candidate.job_id.clone()))
                .bind(("claim", Ulid::new().to_string()))
                .bind(("worker_id", request.worker_id.clone()))
                .bind(("now_ms", now_ms))
                .bind(("expires_ms", expires_ms))
                .bind(("queue", request.queue.as_str()))
                .bind(("job_type", request.job_type.as_str()))
                .bind(("ceiling", i64::from(request.ceiling)))
                .await?;

            let rows: Vec<JobRow> = response.take(0)?;
            if let Some(row) = rows.into_iter().next() {
                return row.into_job().map(Some);
            }

            if self.active_count(request.queue, request.job_type).await? >= u64::from(request.ceiling) {
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// Mark an active job completed. Only the current claim holder may do so.
    pub async fn complete(
        &self,
        id: JobId,
        claim: Ulid,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing("job", $id)
                SET state = "completed",
                    finished_at = $now_ms,
                    updated_at = $now_ms,
                    claim_token = NONE,
                    claim_expires_at = NONE
                WHERE state = "active" AND claim_token = $claim
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("claim", claim.to_string()))
            .bind(("now_ms", ms(now)))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        let Some(job) = into_jobs(rows)?.into_iter().next() else {
            return Ok(None);
        };

        self.release_dedupe(&job).await?;
        Ok(Some(job))
    }

    /// Record a failure reported by the current claim holder.
    pub async fn fail(&self, report: &FailureReport) -> Result<Option<Job>, DbError> {
        let query = match report.retry_at {
            Some(_) => {
                r#"
                UPDATE type::thing("job", $id)
                SET state = "delayed",
                    run_at = $run_at_ms,
                    last_error = $error,
                    updated_at = $now_ms,
                    claim_token = NONE,
                    claim_expires_at = NONE
                WHERE state = "active" AND claim_token = $claim
                RETURN AFTER
                "#
            }
            None => {
                r#"
                UPDATE type::thing("job", $id)
                SET state = "failed",
                    last_error = $error,
                    finished_at = $now_ms,
                    updated_at = $now_ms,
                    claim_token = NONE,
                    claim_expires_at = NONE
                WHERE state = "active" AND claim_token = $claim
                RETURN AFTER
                "#
            }
        };

        let now_ms = ms(report.now);
        let mut response = self
            .db
            .query(query)
            .bind(("id", report.job_id.to_string()))
            .bind(("claim", report.claim.to_string()))
            .bind(("error", report.error.clone()))
            .bind(("run_at_ms", report.retry_at.map_or(now_ms, ms)))
            .bind(("now_ms", now_ms))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        let Some(job) = into_jobs(rows)?.into_iter().next() else {
            return Ok(None);
        };

        if job.state.is_terminal() {
            self.release_dedupe(&job).await?;
        }
        Ok(Some(job))
    }

    /// Take back active jobs whose claim expired without a report.
    ///
    /// The interrupted attempt counts against the budget: a job that has
    /// used all attempts fails instead of returning to `waiting`.
    pub async fn reclaim_stale(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Vec<Reclaimed>, DbError> {
        let now_ms = ms(now);
        let mut response = self
            .db
            .query(
                r#"
                SELECT * FROM job
                WHERE queue = $queue AND state = "active" AND claim_expires_at <= $now_ms
                "#,
            )
            .bind(("queue", queue.as_str()))
            .bind(("now_ms", now_ms))
            .await?;

        let stale: Vec<JobRow> = response.take(0)?;
        let mut reclaimed = Vec::with_capacity(stale.len());

        for row in stale {
            let Some(claim) = row.claim_token.clone() else {
                continue;
            };
            let worker_id = row.worker_id.clone().unwrap_or_default();
            let exhausted = row.attempts >= row.max_attempts;

            let query = if exhausted {
                r#"
                UPDATE type::thing("job", $id)
                SET state = "failed",
                    last_error = $error,
                    finished_at = $now_ms,
                    updated_at = $now_ms,
                    claim_token = NONE,
                    claim_expires_at = NONE
                WHERE state = "active" AND claim_token = $claim
                RETURN AFTER
                "#
            } else {
                r#"
                UPDATE type::thing("job", $id)
                SET state = "waiting",
                    updated_at = $now_ms,
                    claim_token = NONE,
                    claim_expires_at = NONE
                WHERE state = "active" AND claim_token = $claim
                RETURN AFTER
                "#
            };

            let mut response = self
                .db
                .query(query)
                .bind(("id", row.job_id.clone()))
                .bind(("claim", claim))
                .bind(("error", STALE_CLAIM_ERROR))
                .bind(("now_ms", now_ms))
                .await?;

            let rows: Vec<JobRow> = response.take(0)?;
            if let Some(job) = into_jobs(rows)?.into_iter().next() {
                if job.state.is_terminal() {
                    self.release_dedupe(&job).await?;
                }
                reclaimed.push(Reclaimed { job, worker_id });
            }
        }

        Ok(reclaimed)
    }

    /// Operator retry: `failed -> waiting` with a fresh attempt budget,
    /// bounded by `max_manual_retries`.
    ///
    /// A job with a dedupe key takes the key back in the same transaction;
    /// the retry is refused while another live job holds it.
    pub async fn retry_failed(
        &self,
        id: JobId,
        max_manual_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, DbError> {
        let job = match retryable(self.find(id).await?, max_manual_retries) {
            Ok(job) => job,
            Err(outcome) => return Ok(outcome),
        };

        let now_ms = ms(now);
        let lock_id = job.dedupe_key.as_deref().map(|key| dedupe_lock_id(job.queue, key));
        if let Some(lock_id) = lock_id.as_deref() {
            match self.inspect_lock(lock_id, now_ms).await? {
                LockHolder::Free => {}
                LockHolder::Live(holder) => return Ok(RetryOutcome::KeyInUse(holder.id)),
                LockHolder::Orphan => {
                    return Err(DbError::Conflict(format!(
                        "dedupe lock {} is held by a missing job",
                        lock_id
                    )));
                }
            }
        }

        let query = match lock_id {
            Some(_) => RETRY_WITH_LOCK,
            None => RETRY,
        };
        let result = self
            .db
            .query(query)
            .bind(("id", id.to_string()))
            .bind(("max", i64::from(max_manual_retries)))
            .bind(("now_ms", now_ms))
            .bind(("lock_id", lock_id.clone().unwrap_or_default()))
            .bind((
                "lock",
                DedupeRow {
                    job_id: id.to_string(),
                    created_at: now_ms,
                },
            ))
            .await
            .and_then(|response| response.check());

        if let Err(e) = result {
            // Lost a race: report why if the job or its key changed hands.
            if let Err(outcome) = retryable(self.find(id).await?, max_manual_retries) {
                return Ok(outcome);
            }
            if let Some(lock_id) = lock_id.as_deref() {
                if let LockHolder::Live(holder) = self.inspect_lock(lock_id, now_ms).await? {
                    return Ok(RetryOutcome::KeyInUse(holder.id));
                }
            }
            return Err(e.into());
        }

        Ok(match self.find(id).await? {
            Some(job) => RetryOutcome::Retried(job),
            None => RetryOutcome::NotFound,
        })
    }

    /// Count jobs by state for a queue.
    pub async fn count_by_state(&self, queue: QueueName) -> Result<BTreeMap<JobState, u64>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT state, count() AS count
                FROM job
                WHERE queue = $queue
                GROUP BY state
                "#,
            )
            .bind(("queue", queue.as_str()))
            .await?;

        #[derive(Deserialize)]
        struct StateCount {
            state: Option<String>,
            count: i64,
        }

        let counts: Vec<StateCount> = response.take(0)?;

        let mut map = BTreeMap::new();
        for count in counts {
            if let Some(state) = count.state.and_then(|s| s.parse::<JobState>().ok()) {
                map.insert(state, count.count.max(0) as u64);
            }
        }

        Ok(map)
    }

    /// Delete all but the `keep` most recently finished jobs in `state`.
    pub async fn trim_terminal(&self, queue: QueueName, state: JobState, keep: usize) -> Result<u64, DbError> {
        if !state.is_terminal() {
            return Err(DbError::Query(format!("cannot trim {} jobs", state)));
        }

        let mut response = self
            .db
            .query(
                r#"
                SELECT job_id, finished_at FROM job
                WHERE queue = $queue AND state = $state
                ORDER BY finished_at DESC
                START $keep
                "#,
            )
            .bind(("queue", queue.as_str()))
            .bind(("state", state.as_str()))
            .bind(("keep", keep as i64))
            .await?;

        #[derive(Deserialize)]
        struct Expired {
            job_id: String,
        }

        let expired: Vec<Expired> = response.take(0)?;
        if expired.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = expired.into_iter().map(|e| e.job_id).collect();
        let count = ids.len() as u64;

        self.db
            .query("DELETE job WHERE queue = $queue AND state = $state AND job_id IN $ids")
            .bind(("queue", queue.as_str()))
            .bind(("state", state.as_str()))
            .bind(("ids", ids))
            .await?
            .check()?;

        Ok(count)
    }

    /// Release the dedupe key held by `job`, if any.
    async fn release_dedupe(&self, job: &Job) -> Result<(), DbError> {
        match job.dedupe_key.as_deref() {
            Some(key) => {
                self.release_dedupe_lock(&dedupe_lock_id(job.queue, key), &job.id.to_string())
                    .await
            }
            None => Ok(()),
        }
    }

    async fn release_dedupe_lock(&self, lock_id: &str, holder: &str) -> Result<(), DbError> {
        self.db
            .query(r#"DELETE type::thing("job_dedupe", $lock) WHERE job_id = $holder"#)
            .bind(("lock", lock_id.to_string()))
            .bind(("holder", holder.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}
