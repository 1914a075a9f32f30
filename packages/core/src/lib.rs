//! Core domain types for the background job scheduler.
//!
//! This crate contains shared types used across all packages:
//! - Job records, their states and producer options
//! - The typed registry of queues, job types and payloads
//! - Per-type policies and static scheduler configuration
//! - Events for downstream consumers

mod clock;
mod config;
mod error;
mod events;
mod job;
mod kind;
mod policy;
mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Recurring, SchedulerConfig};
pub use error::{QueueError, QueueResult};
pub use events::JobEvent;
pub use job::{Claim, EnqueueOptions, Job, JobId, JobResult, JobState, Priority};
pub use kind::{JobKind, JobType, QueueName};
pub use policy::{Backoff, JobPolicy};
pub use queue::{QueueConfig, QueueState, QueueStats, Retention};
