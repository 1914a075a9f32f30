use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{JobType, QueueName};
use jobs_db::{ClaimRequest, Database, DbConfig, DbError};

/// Fresh in-memory store with the schema applied. Each call is isolated.
pub async fn setup_db() -> Result<Database, DbError> {
    jobs_db::init(&DbConfig::memory()).await
}

/// Millisecond-aligned start time so stored timestamps compare equal.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default()
}

pub fn at(offset_ms: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::milliseconds(offset_ms)
}

pub fn claim(queue: QueueName, job_type: JobType, ceiling: u32, now: DateTime<Utc>) -> ClaimRequest {
    ClaimRequest {
        queue,
        job_type,
        worker_id: "worker-1".to_string(),
        ceiling,
        lease: Duration::from_secs(10),
        now,
    }
}
