//! Actor system for the job scheduler.
//!
//! This crate provides the Ractor-based actors that schedule and execute
//! jobs stored by `jobs_db`.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor that owns the queue actors and routes requests
//! - `QueueActor` - Scheduler for a single queue: promotion, claims, retries, retention
//! - `WorkerActor` - Executes one job at a time for a single job type
//! - `Trigger` - Creates delayed one-shot jobs and keeps recurring jobs alive
//!
//! # Usage
//!
//! ```ignore
//! use jobs_actors::{FnHandler, HandlerRegistry, JobQueues};
//! use jobs_core::{EnqueueOptions, JobKind, JobResult, JobType, SchedulerConfig};
//!
//! let handlers = HandlerRegistry::builder()
//!     .register(JobType::PayTo, FnHandler::new(|job, _ctx| async move {
//!         Ok(JobResult::new(format!("paid {}", job.id)))
//!     }))
//!     .build();
//!
//! let db = jobs_db::init(&jobs_db::DbConfig::memory()).await?;
//! let (queues, handle) = JobQueues::start(db, SchedulerConfig::standard(), handlers).await?;
//!
//! queues
//!     .enqueue(JobKind::PayTo { tx_id: "tx-1".into() }, EnqueueOptions::new())
//!     .await?;
//! ```

mod client;
mod handler;
mod messages;
mod queue_actor;
mod supervisor;
mod trigger;
mod worker_actor;

pub use client::JobQueues;
pub use handler::{
    FnHandler, HandlerError, HandlerFuture, HandlerRegistry, HandlerRegistryBuilder,
    HandlerResult, JobContext, JobHandler,
};
pub use messages::{JobOutcome, QueueMessage, SupervisorMessage, TickReport, WorkerMessage};
pub use queue_actor::{QueueActor, QueueActorArgs};
pub use supervisor::{Supervisor, SupervisorArgs, start_supervisor};
pub use trigger::Trigger;
pub use worker_actor::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
