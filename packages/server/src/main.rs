//! Job scheduler process.

mod config;
mod handlers;

use jobs_actors::JobQueues;
use jobs_core::{JobEvent, QueueName};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!(endpoint = %config.db.endpoint, "Initializing job scheduler...");

    let db = jobs_db::init(&config.db).await?;
    let handlers = handlers::registry();
    let (queues, handle) = JobQueues::start(db, config.scheduler, handlers).await?;
    tokio::spawn(log_events(queues.subscribe()));

    tracing::info!("Job scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown requested");
    log_summary(&queues).await;
    queues.shutdown()?;
    handle.await?;

    tracing::info!("Job scheduler stopped");
    Ok(())
}

/// Mirror scheduler events into the log until the channel closes.
async fn log_events(mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => tracing::debug!(
                queue = %event.queue(),
                job_id = ?event.job_id(),
                state = ?event.job_state(),
                at = %event.timestamp(),
                "{}",
                event.description()
            ),
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_summary(queues: &JobQueues) {
    for queue in QueueName::ALL {
        match queues.counts(queue).await {
            Ok(stats) => {
                if let Some(success_rate) = stats.success_rate() {
                    tracing::info!(
                        %queue,
                        processed = stats.processed(),
                        pending = stats.pending(),
                        success_rate,
                        "Queue summary"
                    );
                }
            }
            Err(e) => tracing::warn!(%queue, "Failed to read queue counts: {}", e),
        }
    }
}
