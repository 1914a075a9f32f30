//! Per-job-type execution policy: concurrency ceiling, retries, backoff, timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kind::JobType;

/// Delay before a failed job is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed { delay: Duration },
    /// `base * 2^attempts`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to apply after the given number of attempts have been made.
    pub fn delay(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(600),
        }
    }
}

/// Scheduling and retry rules for one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Max simultaneously active jobs of this type.
    pub ceiling: u32,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound on one handler invocation.
    pub timeout: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            ceiling: 1,
            max_attempts: 3,
            backoff: Backoff::default(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl JobPolicy {
    pub fn with_ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = ceiling.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl JobType {
    /// Production defaults. Types without an explicit ceiling run one at a time.
    pub fn default_policy(self) -> JobPolicy {
        let policy = JobPolicy::default();
        match self {
            JobType::PublishArticle | JobType::PublishRevisedArticle => policy.with_ceiling(100),
            JobType::RefreshIpnsFeed => policy.with_ceiling(2),
            JobType::Migration => policy
                .with_ceiling(2)
                .with_timeout(Duration::from_secs(30 * 60)),
            JobType::PayToByBlockchain => policy.with_ceiling(25),
            JobType::TxTimeout => policy.with_max_attempts(5),
            _ => policy,
        }
    }
}
