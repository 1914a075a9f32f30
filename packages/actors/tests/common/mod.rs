#![allow(dead_code)]

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_actors::{FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler, JobQueues};
use jobs_core::{Clock, Job, JobEvent, JobId, JobResult, ManualClock, SchedulerConfig};
use jobs_db::{Database, DbConfig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Long enough that the timer never fires during a test; ticks are forced.
const IDLE_TICK: Duration = Duration::from_secs(3600);

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub type TestResult<T = ()> = Result<T, Box<dyn Error>>;

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default()
}

pub struct Harness {
    pub queues: JobQueues,
    pub clock: ManualClock,
    pub db: Database,
    pub events: broadcast::Receiver<JobEvent>,
    handle: JoinHandle<()>,
}

impl Harness {
    pub async fn start(handlers: Arc<HandlerRegistry>) -> TestResult<Self> {
        Self::start_with(handlers, SchedulerConfig::default()).await
    }

    pub async fn start_with(handlers: Arc<HandlerRegistry>, config: SchedulerConfig) -> TestResult<Self> {
        let db = jobs_db::init(&DbConfig::memory()).await?;
        let clock = ManualClock::new(t0());
        let config = config.with_tick_interval(IDLE_TICK);

        let (queues, handle) =
            JobQueues::start_with_clock(db.clone(), config, handlers, Arc::new(clock.clone())).await?;
        let events = queues.subscribe();

        Ok(Self {
            queues,
            clock,
            db,
            events,
            handle,
        })
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(chrono::Duration::from_std(by).unwrap_or_default());
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&JobEvent) -> bool) -> TestResult<JobEvent> {
        let events = &mut self.events;
        let found = tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return Ok(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err("event channel closed"),
                }
            }
        })
        .await
        .map_err(|_| "timed out waiting for event")??;
        Ok(found)
    }

    pub async fn wait_completed(&mut self, job_id: JobId) -> TestResult<JobEvent> {
        self.wait_for(|e| matches!(e, JobEvent::JobCompleted { job_id: id, .. } if *id == job_id))
            .await
    }

    pub async fn stop(self) -> TestResult {
        self.queues.shutdown()?;
        tokio::time::timeout(EVENT_TIMEOUT, self.handle).await??;
        Ok(())
    }
}

/// Shared log of the jobs a handler saw, in execution order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<JobId>>>,
}

impl Recorder {
    pub fn record(&self, id: JobId) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(id);
        }
    }

    pub fn seen(&self) -> Vec<JobId> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    pub fn count(&self, id: JobId) -> usize {
        self.seen().into_iter().filter(|seen| *seen == id).count()
    }
}

/// Handler that records each execution and succeeds.
pub fn recording(recorder: Recorder) -> impl JobHandler {
    FnHandler::new(move |job: Job, _ctx: JobContext| {
        recorder.record(job.id);
        std::future::ready(Ok::<_, HandlerError>(JobResult::new("done")))
    })
}

/// Handler that records each execution and always fails with `error`.
pub fn failing(recorder: Recorder, error: HandlerError) -> impl JobHandler {
    FnHandler::new(move |job: Job, _ctx: JobContext| {
        recorder.record(job.id);
        std::future::ready(Err::<JobResult, _>(error.clone()))
    })
}
