//! Queue domain types for job containers.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{JobState, Priority};
use crate::kind::QueueName;

/// Current operational state of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Queue is dispatching jobs.
    #[default]
    Running,
    /// Queue accepts jobs but dispatches none.
    Paused,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Running => "running",
            QueueState::Paused => "paused",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many terminal records a queue keeps for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Terminal records are purged on the next tick.
    None,
    Small,
    #[default]
    Medium,
    Large,
}

impl Retention {
    /// Records kept per terminal state.
    pub fn keep(self) -> usize {
        match self {
            Retention::None => 0,
            Retention::Small => 100,
            Retention::Medium => 1_000,
            Retention::Large => 10_000,
        }
    }
}

/// Configuration for queue behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Interval between scheduling passes.
    pub tick_interval: Duration,
    pub retention: Retention,
    /// Extra time past a job's timeout before its claim is considered stale.
    pub stale_grace: Duration,
    pub default_priority: Priority,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retention: Retention::default(),
            stale_grace: Duration::from_secs(30),
            default_priority: Priority::NORMAL,
        }
    }
}

impl QueueConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_stale_grace(mut self, stale_grace: Duration) -> Self {
        self.stale_grace = stale_grace;
        self
    }

    /// Production defaults per queue.
    pub fn standard(queue: QueueName) -> Self {
        let config = Self::default();
        match queue {
            QueueName::PayTo
            | QueueName::PayToByBlockchain
            | QueueName::TxTimeout
            | QueueName::Payout => config
                .with_tick_interval(Duration::from_millis(250))
                .with_retention(Retention::Large),
            QueueName::Migration => config
                .with_tick_interval(Duration::from_secs(2))
                .with_retention(Retention::Small),
            QueueName::Publication | QueueName::Revision => config.with_retention(Retention::Large),
            QueueName::Ipfs | QueueName::ExchangeRate => config.with_retention(Retention::None),
            _ => config,
        }
    }
}

/// Job counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Build from a `state -> count` map as returned by the store.
    pub fn from_counts(counts: &BTreeMap<JobState, u64>) -> Self {
        let get = |state| counts.get(&state).copied().unwrap_or(0);
        Self {
            waiting: get(JobState::Waiting),
            delayed: get(JobState::Delayed),
            active: get(JobState::Active),
            completed: get(JobState::Completed),
            failed: get(JobState::Failed),
        }
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    /// Jobs not yet terminal.
    pub fn pending(&self) -> u64 {
        self.waiting + self.delayed + self.active
    }

    /// Total processed jobs still retained.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.processed();
        if total == 0 {
            None
        } else {
            Some((self.completed as f64 / total as f64) * 100.0)
        }
    }
}
