//! End-to-end scheduling tests against an in-memory store.
//!
//! Every test drives time through a manual clock and forces ticks, so
//! nothing is dispatched unless the test asks for it.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Harness, Recorder, TestResult, failing, recording, t0};
use jobs_actors::{FnHandler, HandlerError, HandlerRegistry, JobContext, JobQueues};
use jobs_core::{
    Backoff, EnqueueOptions, Job, JobEvent, JobId, JobKind, JobPolicy, JobResult, JobState, JobType,
    Priority, QueueConfig, QueueError, QueueName, QueueState, Recurring, Retention,
    SchedulerConfig,
};
use jobs_db::{ClaimRequest, JobRepository};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::error::TryRecvError;

fn pay(tx_id: &str) -> JobKind {
    JobKind::PayTo {
        tx_id: tx_id.into(),
    }
}

/// Handler that blocks until the test adds permits to `gate`, tracking how
/// many invocations overlap.
fn gated(gate: Arc<Semaphore>, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> impl jobs_actors::JobHandler {
    FnHandler::new(move |_job: Job, _ctx: JobContext| {
        let (gate, running, peak) = (gate.clone(), running.clone(), peak.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            let acquired = gate.acquire().await;
            running.fetch_sub(1, Ordering::SeqCst);
            match acquired {
                Ok(permit) => permit.forget(),
                Err(e) => return Err(HandlerError::permanent(e.to_string())),
            }
            Ok::<_, HandlerError>(JobResult::new("paid"))
        }
    })
}

#[tokio::test]
async fn higher_priority_is_dispatched_first() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(recorder.clone()))
        .build();
    let mut h = Harness::start(handlers).await?;

    let low = h
        .queues
        .enqueue(pay("tx-low"), EnqueueOptions::new().with_priority(Priority::LOW))
        .await?;
    let critical = h
        .queues
        .enqueue(pay("tx-critical"), EnqueueOptions::new().with_priority(Priority::CRITICAL))
        .await?;

    // One worker: only the critical job fits in this tick.
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.dispatched, vec![critical]);
    h.wait_completed(critical).await?;

    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.dispatched, vec![low]);
    h.wait_completed(low).await?;

    assert_eq!(recorder.seen(), vec![critical, low]);

    h.stop().await
}

#[tokio::test]
async fn delayed_job_waits_for_its_run_time() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(recorder.clone()))
        .build();
    let mut h = Harness::start(handlers).await?;

    let id = h
        .queues
        .enqueue(
            pay("tx-later"),
            EnqueueOptions::new().with_delay(chrono::Duration::milliseconds(5_000)),
        )
        .await?;

    let job = h.queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.run_at, t0() + chrono::Duration::milliseconds(5_000));

    let report = h.queues.tick(QueueName::PayTo).await?;
    assert!(report.dispatched.is_empty());

    h.advance(Duration::from_millis(4_999));
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.promoted, 0);
    assert!(report.dispatched.is_empty());

    h.advance(Duration::from_millis(1));
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.promoted, 1);
    assert_eq!(report.dispatched, vec![id]);
    h.wait_completed(id).await?;

    assert_eq!(recorder.count(id), 1);
    h.stop().await
}

#[tokio::test]
async fn schedule_at_uses_an_absolute_time() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(recorder.clone()))
        .build();
    let mut h = Harness::start(handlers).await?;

    let at = t0() + chrono::Duration::seconds(10);
    let id = h.queues.schedule_at(pay("tx-at"), at).await?;

    let job = h.queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.run_at, at);

    h.advance(Duration::from_secs(10));
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.dispatched, vec![id]);
    h.wait_completed(id).await?;

    h.stop().await
}

#[tokio::test]
async fn active_jobs_never_exceed_the_ceiling() -> TestResult {
    let gate = Arc::new(Semaphore::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::builder()
        .register_with_policy(
            JobType::PayTo,
            gated(gate.clone(), running.clone(), peak.clone()),
            JobPolicy::default().with_ceiling(2),
        )
        .build();
    let mut h = Harness::start(handlers).await?;

    for n in 0..5 {
        h.queues
            .enqueue(pay(&format!("tx-{}", n)), EnqueueOptions::new())
            .await?;
    }

    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.dispatched.len(), 2);

    let report = h.queues.tick(QueueName::PayTo).await?;
    assert!(report.dispatched.is_empty());

    let stats = h.queues.counts(QueueName::PayTo).await?;
    assert_eq!(stats.active, 2);
    assert_eq!(stats.waiting, 3);

    gate.add_permits(5);
    let mut completed = 0;
    while completed < 5 {
        h.wait_for(|e| matches!(e, JobEvent::JobCompleted { .. }))
            .await?;
        completed += 1;
        h.queues.tick(QueueName::PayTo).await?;
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    let stats = h.queues.counts(QueueName::PayTo).await?;
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.pending(), 0);

    h.stop().await
}

#[tokio::test]
async fn unique_enqueue_returns_the_live_job() -> TestResult {
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(Recorder::default()))
        .build();
    let mut h = Harness::start(handlers).await?;

    let first = h
        .queues
        .enqueue_unique(pay("tx-1"), "pay:tx-1", EnqueueOptions::new())
        .await?;
    let again = h
        .queues
        .enqueue_unique(pay("tx-1"), "pay:tx-1", EnqueueOptions::new())
        .await?;
    assert_eq!(first, again);
    assert_eq!(h.queues.counts(QueueName::PayTo).await?.waiting, 1);

    h.queues.tick(QueueName::PayTo).await?;
    h.wait_completed(first).await?;

    let after = h
        .queues
        .enqueue_unique(pay("tx-1"), "pay:tx-1", EnqueueOptions::new())
        .await?;
    assert_ne!(first, after);

    h.stop().await
}

#[tokio::test]
async fn cancel_removes_waiting_jobs_only() -> TestResult {
    let gate = Arc::new(Semaphore::new(0));
    let handlers = HandlerRegistry::builder()
        .register(
            JobType::PayTo,
            gated(gate.clone(), Arc::default(), Arc::default()),
        )
        .build();
    let mut h = Harness::start(handlers).await?;

    let running = h.queues.enqueue(pay("tx-run"), EnqueueOptions::new()).await?;
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.dispatched, vec![running]);

    let waiting = h.queues.enqueue(pay("tx-wait"), EnqueueOptions::new()).await?;
    assert!(h.queues.cancel(waiting).await?);
    assert!(h.queues.get(waiting).await?.is_none());
    assert!(!h.queues.cancel(waiting).await?);

    // Active jobs run to completion.
    assert!(!h.queues.cancel(running).await?);
    gate.add_permits(1);
    h.wait_completed(running).await?;

    let report = h.queues.tick(QueueName::PayTo).await?;
    assert!(report.dispatched.is_empty());

    let job = h.queues.get(running).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Completed);
    assert!(!h.queues.cancel(running).await?);

    h.stop().await
}

#[tokio::test]
async fn retryable_failures_back_off_until_exhausted() -> TestResult {
    let recorder = Recorder::default();
    let policy = JobPolicy::default()
        .with_max_attempts(3)
        .with_backoff(Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(3600),
        });
    let handlers = HandlerRegistry::builder()
        .register_with_policy(
            JobType::PayTo,
            failing(recorder.clone(), HandlerError::retryable("provider unavailable")),
            policy,
        )
        .build();
    let mut h = Harness::start(handlers).await?;

    let id = h.queues.enqueue(pay("tx-flaky"), EnqueueOptions::new()).await?;

    h.queues.tick(QueueName::PayTo).await?;
    let first = h
        .wait_for(|e| matches!(e, JobEvent::JobRetrying { job_id, .. } if *job_id == id))
        .await?;
    let JobEvent::JobRetrying { attempts, run_at, .. } = first else {
        return Err("unexpected event".into());
    };
    assert_eq!(attempts, 1);
    let first_gap = run_at - h.clock_now();
    assert_eq!(first_gap, chrono::Duration::seconds(2));

    let job = h.queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.last_error.as_deref(), Some("provider unavailable"));

    // Not yet due.
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert!(report.dispatched.is_empty());

    h.advance(Duration::from_secs(2));
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.dispatched, vec![id]);
    let second = h
        .wait_for(|e| matches!(e, JobEvent::JobRetrying { job_id, .. } if *job_id == id))
        .await?;
    let JobEvent::JobRetrying { attempts, run_at, .. } = second else {
        return Err("unexpected event".into());
    };
    assert_eq!(attempts, 2);
    let second_gap = run_at - h.clock_now();
    assert!(second_gap > first_gap);

    h.advance(Duration::from_secs(4));
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.dispatched, vec![id]);
    let failed = h
        .wait_for(|e| matches!(e, JobEvent::JobFailed { job_id, .. } if *job_id == id))
        .await?;
    let JobEvent::JobFailed { attempts, error, .. } = failed else {
        return Err("unexpected event".into());
    };
    assert_eq!(attempts, 3);
    assert_eq!(error, "provider unavailable");

    let job = h.queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.claim.is_none());
    assert_eq!(recorder.count(id), 3);

    h.stop().await
}

#[tokio::test]
async fn permanent_failure_skips_retries() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(
            JobType::PayTo,
            failing(recorder.clone(), HandlerError::permanent("unknown transaction")),
        )
        .build();
    let mut h = Harness::start(handlers).await?;

    let id = h.queues.enqueue(pay("tx-bad"), EnqueueOptions::new()).await?;
    h.queues.tick(QueueName::PayTo).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobFailed { job_id, .. } if *job_id == id))
        .await?;

    let job = h.queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(recorder.count(id), 1);

    h.stop().await
}

#[tokio::test]
async fn stale_claims_are_reclaimed_and_run_once() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(recorder.clone()))
        .build();
    let mut h = Harness::start(handlers).await?;

    let id = h.queues.enqueue(pay("tx-orphan"), EnqueueOptions::new()).await?;

    // A worker from another process claims the job and dies.
    let repo = JobRepository::new(h.db.clone());
    let crashed = repo
        .claim_next(&ClaimRequest {
            queue: QueueName::PayTo,
            job_type: JobType::PayTo,
            worker_id: "crashed-worker".into(),
            ceiling: 1,
            lease: Duration::from_secs(1),
            now: h.clock_now(),
        })
        .await?
        .ok_or("claim failed")?;
    let token = crashed.claim.as_ref().ok_or("claim missing")?.token;

    // The lease is still valid and the ceiling is taken.
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.reclaimed, 0);
    assert!(report.dispatched.is_empty());

    h.advance(Duration::from_secs(2));
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.dispatched, vec![id]);
    h.wait_completed(id).await?;

    assert_eq!(recorder.count(id), 1);

    // The zombie's late report is rejected.
    assert!(repo.complete(id, token, h.clock_now()).await?.is_none());
    let job = h.queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 2);

    h.stop().await
}

#[tokio::test]
async fn recurring_jobs_keep_one_live_occurrence() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(JobType::SyncCurationEvents, recording(recorder.clone()))
        .build();
    let config = SchedulerConfig::default().with_recurring(Recurring::new(
        "syncCurationEvents",
        JobKind::SyncCurationEvents {},
        Duration::from_secs(60),
    ));
    let mut h = Harness::start_with(handlers, config).await?;
    let queue = QueueName::PayToByBlockchain;

    // The first occurrence is created at startup.
    let stats = h.queues.counts(queue).await?;
    assert_eq!(stats.delayed, 1);

    let report = h.queues.tick(queue).await?;
    assert_eq!(report.scheduled, 0);
    assert!(report.dispatched.is_empty());

    h.advance(Duration::from_secs(60));
    let report = h.queues.tick(queue).await?;
    assert_eq!(report.promoted, 1);
    assert_eq!(report.dispatched.len(), 1);

    let next = h
        .wait_for(|e| matches!(e, JobEvent::JobEnqueued { job, .. } if job.dedupe_key.as_deref() == Some("repeat:syncCurationEvents")))
        .await?;
    let JobEvent::JobEnqueued { job, .. } = next else {
        return Err("unexpected event".into());
    };
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.run_at, t0() + chrono::Duration::seconds(120));

    let report = h.queues.tick(queue).await?;
    assert_eq!(report.scheduled, 0);

    let stats = h.queues.counts(queue).await?;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.delayed, 1);
    assert_eq!(recorder.seen().len(), 1);

    h.stop().await
}

#[tokio::test]
async fn paused_queue_accepts_but_does_not_dispatch() -> TestResult {
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(Recorder::default()))
        .build();
    let mut h = Harness::start(handlers).await?;

    h.queues.pause(QueueName::PayTo).await?;
    h.wait_for(|e| {
        matches!(
            e,
            JobEvent::QueueStateChanged {
                new_state: QueueState::Paused,
                ..
            }
        )
    })
    .await?;

    let id = h.queues.enqueue(pay("tx-paused"), EnqueueOptions::new()).await?;
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert!(report.paused);
    assert!(report.dispatched.is_empty());
    assert_eq!(h.queues.counts(QueueName::PayTo).await?.waiting, 1);

    h.queues.resume(QueueName::PayTo).await?;
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert!(!report.paused);
    assert_eq!(report.dispatched, vec![id]);
    h.wait_completed(id).await?;

    h.stop().await
}

#[tokio::test]
async fn pause_and_jobs_survive_a_restart() -> TestResult {
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(Recorder::default()))
        .build();
    let h = Harness::start(handlers.clone()).await?;
    let db = h.db.clone();
    let clock = h.clock.clone();

    h.queues.pause(QueueName::PayTo).await?;
    let id = h.queues.enqueue(pay("tx-restart"), EnqueueOptions::new()).await?;
    h.stop().await?;

    let config = SchedulerConfig::default().with_tick_interval(Duration::from_secs(3600));
    let (queues, handle) =
        JobQueues::start_with_clock(db, config, handlers, Arc::new(clock)).await?;

    let report = queues.tick(QueueName::PayTo).await?;
    assert!(report.paused);
    let job = queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Waiting);

    queues.shutdown()?;
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn failed_jobs_can_be_inspected_retried_and_purged() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(
            JobType::PayTo,
            failing(recorder.clone(), HandlerError::permanent("card declined")),
        )
        .build();
    let config = SchedulerConfig::default().with_max_manual_retries(1);
    let mut h = Harness::start_with(handlers, config).await?;

    let id = h.queues.enqueue(pay("tx-declined"), EnqueueOptions::new()).await?;

    // Only failed jobs can be retried.
    let err = h.queues.retry(id).await.err().ok_or("retry of a waiting job succeeded")?;
    assert!(matches!(err, QueueError::InvalidTransition { .. }));

    h.queues.tick(QueueName::PayTo).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobFailed { job_id, .. } if *job_id == id))
        .await?;

    let failed = h.queues.failed(QueueName::PayTo, 10).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].last_error.as_deref(), Some("card declined"));

    let retried = h.queues.retry(id).await?;
    assert_eq!(retried.state, JobState::Waiting);
    assert_eq!(retried.attempts, 0);
    assert_eq!(retried.manual_retries, 1);

    h.queues.tick(QueueName::PayTo).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobFailed { job_id, .. } if *job_id == id))
        .await?;
    assert_eq!(recorder.count(id), 2);

    let err = h.queues.retry(id).await.err().ok_or("retry beyond the limit succeeded")?;
    assert!(matches!(err, QueueError::RetryLimitReached(_)));

    let unknown = h.queues.retry(jobs_core::JobId::new()).await.err().ok_or("retry of unknown job succeeded")?;
    assert!(matches!(unknown, QueueError::JobNotFound(_)));

    let err = h
        .queues
        .purge(QueueName::PayTo, JobState::Waiting)
        .await
        .err()
        .ok_or("purge of waiting jobs succeeded")?;
    assert!(matches!(err, QueueError::Unsupported(_)));

    assert_eq!(h.queues.purge(QueueName::PayTo, JobState::Failed).await?, 1);
    assert_eq!(h.queues.counts(QueueName::PayTo).await?.failed, 0);
    assert!(h.queues.get(id).await?.is_none());

    h.stop().await
}

#[tokio::test]
async fn retry_waits_for_the_key_holder_to_finish() -> TestResult {
    let handlers = HandlerRegistry::builder()
        .register(
            JobType::PayTo,
            failing(Recorder::default(), HandlerError::permanent("card declined")),
        )
        .build();
    let mut h = Harness::start(handlers).await?;

    let original = h
        .queues
        .enqueue_unique(pay("tx-1"), "pay:tx-1", EnqueueOptions::new())
        .await?;
    h.queues.tick(QueueName::PayTo).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobFailed { job_id, .. } if *job_id == original))
        .await?;

    // A paused queue keeps the replacement waiting, and holding the key.
    h.queues.pause(QueueName::PayTo).await?;
    let replacement = h
        .queues
        .enqueue_unique(pay("tx-1"), "pay:tx-1", EnqueueOptions::new())
        .await?;
    assert_ne!(replacement, original);

    let err = h.queues.retry(original).await.err().ok_or("retry took a held key")?;
    assert_eq!(
        err,
        QueueError::DedupeKeyInUse {
            job_id: original,
            holder: replacement,
        }
    );

    assert!(h.queues.cancel(replacement).await?);
    let retried = h.queues.retry(original).await?;
    assert_eq!(retried.state, JobState::Waiting);
    assert_eq!(
        h.queues
            .enqueue_unique(pay("tx-1"), "pay:tx-1", EnqueueOptions::new())
            .await?,
        original
    );

    h.stop().await
}

#[tokio::test]
async fn retention_trims_terminal_records() -> TestResult {
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(Recorder::default()))
        .build();
    let config = SchedulerConfig::default()
        .with_queue(QueueName::PayTo, QueueConfig::default().with_retention(Retention::None));
    let mut h = Harness::start_with(handlers, config).await?;

    let id = h.queues.enqueue(pay("tx-trim"), EnqueueOptions::new()).await?;
    h.queues.tick(QueueName::PayTo).await?;
    h.wait_completed(id).await?;

    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.trimmed, 1);
    assert!(h.queues.get(id).await?.is_none());

    h.stop().await
}

#[tokio::test]
async fn invalid_payload_is_rejected_without_a_record() -> TestResult {
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(Recorder::default()))
        .build();
    let h = Harness::start(handlers).await?;

    let err = h
        .queues
        .enqueue(pay("  "), EnqueueOptions::new())
        .await
        .err()
        .ok_or("invalid payload accepted")?;
    assert!(matches!(err, QueueError::InvalidPayload(_)));

    let stats = h.queues.counts(QueueName::PayTo).await?;
    assert_eq!(stats.pending(), 0);

    h.stop().await
}

#[tokio::test]
async fn jobs_without_a_handler_stay_waiting() -> TestResult {
    let h = Harness::start(HandlerRegistry::builder().build()).await?;

    let id = h.queues.enqueue(pay("tx-orphan"), EnqueueOptions::new()).await?;
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert!(report.dispatched.is_empty());

    let job = h.queues.get(id).await?.ok_or("job missing")?;
    assert_eq!(job.state, JobState::Waiting);

    h.stop().await
}

#[tokio::test]
async fn every_observed_transition_is_legal() -> TestResult {
    let gate = Arc::new(Semaphore::new(0));
    let flaky = FnHandler::new(|_job: Job, ctx: JobContext| {
        std::future::ready(if ctx.attempt == 1 {
            Err(HandlerError::retryable("provider unavailable"))
        } else {
            Ok(JobResult::new("recovered"))
        })
    });
    let handlers = HandlerRegistry::builder()
        .register(JobType::Payout, recording(Recorder::default()))
        .register_with_policy(
            JobType::TxTimeout,
            flaky,
            JobPolicy::default().with_backoff(Backoff::Fixed {
                delay: Duration::from_secs(1),
            }),
        )
        .register(
            JobType::PayToByBlockchain,
            failing(Recorder::default(), HandlerError::permanent("chain rejected")),
        )
        .register_with_policy(
            JobType::PayTo,
            gated(gate.clone(), Arc::default(), Arc::default()),
            JobPolicy::default()
                .with_ceiling(2)
                .with_timeout(Duration::from_secs(5)),
        )
        .build();
    let config = SchedulerConfig::default().with_max_manual_retries(1);
    let mut h = Harness::start_with(handlers, config).await?;
    let mut events = h.queues.subscribe();

    // Succeeds on the first attempt.
    let succeeded = h
        .queues
        .enqueue(JobKind::Payout { tx_id: "tx-ok".into() }, EnqueueOptions::new())
        .await?;
    h.queues.tick(QueueName::Payout).await?;
    h.wait_completed(succeeded).await?;

    // Fails once, backs off, then succeeds.
    let retried = h
        .queues
        .enqueue(JobKind::TxTimeout { tx_id: "tx-flaky".into() }, EnqueueOptions::new())
        .await?;
    let queue = JobType::TxTimeout.queue();
    h.queues.tick(queue).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobRetrying { job_id, .. } if *job_id == retried))
        .await?;
    h.advance(Duration::from_secs(1));
    h.queues.tick(queue).await?;
    h.wait_completed(retried).await?;

    // Fails permanently, is retried by an operator and fails again.
    let declined = h
        .queues
        .enqueue(
            JobKind::PayToByBlockchain { tx_id: "tx-declined".into() },
            EnqueueOptions::new(),
        )
        .await?;
    let queue = JobType::PayToByBlockchain.queue();
    h.queues.tick(queue).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobFailed { job_id, .. } if *job_id == declined))
        .await?;
    h.queues.retry(declined).await?;
    h.queues.tick(queue).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobFailed { job_id, .. } if *job_id == declined))
        .await?;

    // Its first worker hangs past the lease; a second worker finishes it.
    let reclaimed = h.queues.enqueue(pay("tx-hung"), EnqueueOptions::new()).await?;
    h.queues.tick(QueueName::PayTo).await?;
    h.wait_for(|e| matches!(e, JobEvent::JobStarted { job_id, .. } if *job_id == reclaimed))
        .await?;
    h.advance(Duration::from_secs(36));
    let report = h.queues.tick(QueueName::PayTo).await?;
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.dispatched, vec![reclaimed]);
    gate.add_permits(2);
    h.wait_completed(reclaimed).await?;

    let mut trajectories: BTreeMap<JobId, Vec<JobState>> = BTreeMap::new();
    loop {
        match events.try_recv() {
            Ok(event) => {
                if let (Some(job_id), Some(state)) = (event.job_id(), event.job_state()) {
                    trajectories.entry(job_id).or_default().push(state);
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(skipped)) => return Err(format!("missed {} events", skipped).into()),
        }
    }

    use JobState::*;
    let expected = [
        (succeeded, vec![Waiting, Active, Completed]),
        (retried, vec![Waiting, Active, Delayed, Waiting, Active, Completed]),
        (declined, vec![Waiting, Active, Failed, Waiting, Active, Failed]),
        (reclaimed, vec![Waiting, Active, Waiting, Active, Completed]),
    ];
    for (job_id, states) in expected {
        let observed = trajectories.get(&job_id).ok_or("no events for job")?;
        assert_eq!(observed, &states, "job {}", job_id);
        for pair in observed.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "job {}: {} -> {}",
                job_id,
                pair[0],
                pair[1]
            );
        }
    }

    h.stop().await
}

#[tokio::test]
async fn timer_ticks_dispatch_and_leave_the_mailbox_responsive() -> TestResult {
    let recorder = Recorder::default();
    let handlers = HandlerRegistry::builder()
        .register(JobType::PayTo, recording(recorder.clone()))
        .build();
    let db = jobs_db::init(&jobs_db::DbConfig::memory()).await?;
    let config = SchedulerConfig::default().with_tick_interval(Duration::from_millis(5));
    let (queues, handle) = JobQueues::start(db, config, handlers).await?;
    let mut events = queues.subscribe();

    // No forced tick: the timer alone dispatches it.
    let id = queues.enqueue(pay("tx-timer"), EnqueueOptions::new()).await?;
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(JobEvent::JobCompleted { job_id, .. }) if job_id == id => return Ok(()),
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    })
    .await??;
    assert_eq!(recorder.count(id), 1);

    // Many intervals elapse; requests still get through promptly.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = tokio::time::timeout(Duration::from_secs(2), queues.counts(QueueName::PayTo)).await??;
    assert_eq!(stats.completed, 1);

    queues.shutdown()?;
    tokio::time::timeout(Duration::from_secs(10), handle).await??;
    Ok(())
}
