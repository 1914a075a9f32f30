//! Static scheduler configuration, built once at startup.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::Priority;
use crate::kind::{JobKind, QueueName};
use crate::queue::QueueConfig;

/// A job re-enqueued on a fixed cadence after each run finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurring {
    /// Stable name; the dedupe key is derived from it.
    pub name: String,
    pub kind: JobKind,
    /// Gap between one occurrence finishing and the next becoming due.
    pub every: Duration,
    pub priority: Priority,
}

impl Recurring {
    pub fn new(name: impl Into<String>, kind: JobKind, every: Duration) -> Self {
        Self {
            name: name.into(),
            kind,
            every,
            priority: Priority::NORMAL,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.kind.queue()
    }

    /// Dedupe key shared by every occurrence.
    pub fn dedupe_key(&self) -> String {
        format!("repeat:{}", self.name)
    }
}

/// Queue settings and recurring jobs for the whole process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub queues: BTreeMap<QueueName, QueueConfig>,
    pub recurring: Vec<Recurring>,
    /// Operator retries allowed per job after it has failed.
    pub max_manual_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queues: QueueName::ALL
                .into_iter()
                .map(|queue| (queue, QueueConfig::default()))
                .collect(),
            recurring: Vec::new(),
            max_manual_retries: 3,
        }
    }
}

impl SchedulerConfig {
    /// Production queue settings and sweeps.
    pub fn standard() -> Self {
        const MINUTE: Duration = Duration::from_secs(60);

        Self {
            queues: QueueName::ALL
                .into_iter()
                .map(|queue| (queue, QueueConfig::standard(queue)))
                .collect(),
            recurring: vec![
                Recurring::new(
                    "publishPendingDrafts",
                    JobKind::PublishPendingDrafts {},
                    MINUTE * 20,
                )
                .with_priority(Priority::HIGH),
                Recurring::new(
                    "publishPendingRevisionDrafts",
                    JobKind::PublishPendingRevisionDrafts {},
                    MINUTE * 20,
                )
                .with_priority(Priority::HIGH),
                Recurring::new(
                    "verifyIPFSPinHashes",
                    JobKind::VerifyIpfsPinHashes {},
                    MINUTE * 60,
                )
                .with_priority(Priority::LOW),
                Recurring::new(
                    "activateOnboardingUsers",
                    JobKind::ActivateOnboardingUsers {},
                    MINUTE * 60,
                ),
                Recurring::new("unbanUsers", JobKind::UnbanUsers {}, MINUTE * 60),
                Recurring::new(
                    "syncCurationEvents",
                    JobKind::SyncCurationEvents {},
                    MINUTE * 5,
                ),
                Recurring::new(
                    "syncDeliveryFailedEvents",
                    JobKind::SyncDeliveryFailedEvents {},
                    MINUTE * 60,
                )
                .with_priority(Priority::LOW),
                Recurring::new(
                    "transferTrialEndSubscriptions",
                    JobKind::TransferTrialEndSubscriptions {},
                    MINUTE * 30,
                ),
                Recurring::new("updateFiat", JobKind::UpdateFiat {}, MINUTE * 60),
                Recurring::new("updateToken", JobKind::UpdateToken {}, MINUTE * 60),
            ],
            max_manual_retries: 3,
        }
    }

    /// Settings for a queue; queues absent from the map use defaults.
    pub fn queue(&self, queue: QueueName) -> QueueConfig {
        self.queues.get(&queue).cloned().unwrap_or_default()
    }

    pub fn with_queue(mut self, queue: QueueName, config: QueueConfig) -> Self {
        self.queues.insert(queue, config);
        self
    }

    /// Apply the same tick interval to every queue.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        for config in self.queues.values_mut() {
            config.tick_interval = tick_interval;
        }
        self
    }

    pub fn with_recurring(mut self, recurring: Recurring) -> Self {
        self.recurring.push(recurring);
        self
    }

    pub fn with_max_manual_retries(mut self, max_manual_retries: u32) -> Self {
        self.max_manual_retries = max_manual_retries;
        self
    }

    /// Recurring entries that belong to `queue`.
    pub fn recurring_for(&self, queue: QueueName) -> impl Iterator<Item = &Recurring> {
        self.recurring.iter().filter(move |r| r.queue() == queue)
    }
}
