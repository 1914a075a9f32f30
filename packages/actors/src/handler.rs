//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use jobs_core::{Job, JobId, JobPolicy, JobResult, JobType, QueueName};
use thiserror::Error;
use tokio::time::Instant;

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Consumes one attempt; the job is retried while attempts remain.
    #[error("{0}")]
    Retryable(String),
    /// Moves the job straight to `failed`.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

/// Result type for job handlers.
pub type HandlerResult = Result<JobResult, HandlerError>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Execution context handed to a handler alongside the job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub worker_id: String,
    pub timeout: Duration,
    deadline: Instant,
}

impl JobContext {
    pub(crate) fn new(job: &Job, worker_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempts,
            worker_id: worker_id.into(),
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Instant at which the worker abandons this execution.
    ///
    /// Handlers bound their own external calls with
    /// `tokio::time::timeout_at(ctx.deadline(), ..)`.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Trait for job handlers.
///
/// Handlers must be idempotent: a job whose success report was lost is run
/// again.
pub trait JobHandler: Send + Sync + 'static {
    /// Process a job and return the result.
    fn handle(&self, job: &Job, ctx: JobContext) -> HandlerFuture;
}

/// A handler built from an async closure.
pub struct FnHandler<F, Fut> {
    handler: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new function-based handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _future: PhantomData,
        }
    }
}

impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, job: &Job, ctx: JobContext) -> HandlerFuture {
        Box::pin((self.handler)(job.clone(), ctx))
    }
}

struct Registration {
    handler: Arc<dyn JobHandler>,
    policy: JobPolicy,
}

/// Immutable mapping from job type to handler and policy.
///
/// Built once at startup and shared by reference.
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Registration>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Get a handler for a job type.
    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).map(|r| r.handler.clone())
    }

    /// Registered policy, or the type's default when none was registered.
    pub fn policy(&self, job_type: JobType) -> JobPolicy {
        self.handlers
            .get(&job_type)
            .map_or_else(|| job_type.default_policy(), |r| r.policy)
    }

    /// Check if a handler exists for a job type.
    pub fn has_handler(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Registered job types belonging to `queue`, in declaration order.
    pub fn types_for(&self, queue: QueueName) -> Vec<JobType> {
        queue
            .job_types()
            .filter(|job_type| self.has_handler(*job_type))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects registrations before freezing them into a [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobType, Registration>,
}

impl HandlerRegistryBuilder {
    /// Register a handler with the type's default policy.
    pub fn register<H: JobHandler>(self, job_type: JobType, handler: H) -> Self {
        let policy = job_type.default_policy();
        self.register_with_policy(job_type, handler, policy)
    }

    /// Register a handler with an explicit policy. A later registration for
    /// the same type replaces the earlier one.
    pub fn register_with_policy<H: JobHandler>(
        mut self,
        job_type: JobType,
        handler: H,
        policy: JobPolicy,
    ) -> Self {
        self.handlers.insert(
            job_type,
            Registration {
                handler: Arc::new(handler),
                policy,
            },
        );
        self
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
