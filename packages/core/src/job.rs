//! Job domain types for work items in the queue.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::kind::{JobKind, JobType, QueueName};

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution priority. Lower values are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(5);
    pub const MEDIUM: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(15);
    pub const LOW: Priority = Priority(20);

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Priority::CRITICAL => write!(f, "critical"),
            Priority::HIGH => write!(f, "high"),
            Priority::MEDIUM => write!(f, "medium"),
            Priority::NORMAL => write!(f, "normal"),
            Priority::LOW => write!(f, "low"),
            Priority(other) => write!(f, "{}", other),
        }
    }
}

/// Lifecycle state of a job record.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for dispatch on the next tick.
    #[default]
    Waiting,
    /// Not eligible until `run_at` elapses.
    Delayed,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with no retry budget left.
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Pending jobs can still be cancelled.
    pub fn is_pending(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }

    /// Whether a job in this state still holds its dedupe key.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// `Failed -> Waiting` is the manual retry edge; it is bounded by
    /// the scheduler configuration, not here.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Delayed, Waiting)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed)
                | (Active, Waiting)
                | (Failed, Waiting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Human-readable summary of the result.
    pub summary: String,
    /// Optional structured output data as JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl JobResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            output: None,
        }
    }

    pub fn with_output(summary: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            summary: summary.into(),
            output: Some(output),
        }
    }
}

/// Ownership of an active job by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Fresh token per claim; outcome reports must present it.
    pub token: Ulid,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    /// After this instant the claim is considered stale.
    pub expires_at: DateTime<Utc>,
}

/// Producer-side options for a new job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A job represents a unit of work to be executed by the queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// The queue this job belongs to.
    pub queue: QueueName,
    /// Typed payload; its variant selects the handler.
    pub kind: JobKind,
    /// Execution priority.
    pub priority: Priority,
    /// Current state.
    pub state: JobState,
    /// Earliest time the job may be dispatched.
    pub run_at: DateTime<Utc>,
    /// Number of claims granted so far.
    #[serde(default)]
    pub attempts: u32,
    /// Retry ceiling.
    pub max_attempts: u32,
    /// Last failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Producer-supplied key for at-most-one-pending semantics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Present while the job is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
    /// Operator retries used after the job had failed.
    #[serde(default)]
    pub manual_retries: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job that becomes eligible at `now + delay`.
    pub fn new(kind: JobKind, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue: kind.queue(),
            kind,
            priority: Priority::default(),
            state: JobState::Waiting,
            run_at: now,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            dedupe_key: None,
            claim: None,
            manual_retries: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Build a job from producer options, resolving the delay into `run_at`.
    pub fn from_options(
        kind: JobKind,
        options: &EnqueueOptions,
        default_priority: Priority,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = options.delay.unwrap_or_else(Duration::zero);
        Self::new(kind, now)
            .with_priority(options.priority.unwrap_or(default_priority))
            .with_max_attempts(options.max_attempts.unwrap_or(default_max_attempts))
            .with_run_at(now + delay, now)
    }

    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry ceiling. Zero is clamped to one attempt.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the earliest run time; a future time puts the job in `Delayed`.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self.state = if run_at <= now {
            JobState::Waiting
        } else {
            JobState::Delayed
        };
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Eligible for dispatch at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.run_at <= now,
            _ => false,
        }
    }

    /// Whether another attempt may be made after a failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
