//! Queue repository: persisted operational state per queue.

use chrono::{DateTime, Utc};
use jobs_core::{QueueName, QueueState};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// Repository for queue persistence operations.
#[derive(Clone)]
pub struct QueueRepository {
    db: Database,
}

/// Internal record type for SurrealDB reads and writes.
#[derive(Debug, Serialize, Deserialize)]
struct QueueRecord {
    name: String,
    state: QueueState,
    updated_at: i64,
}

impl QueueRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the queue row if missing and return its stored state.
    ///
    /// A restarted process picks up the paused flag left by the previous one.
    pub async fn ensure(&self, name: QueueName, now: DateTime<Utc>) -> Result<QueueState, DbError> {
        let existing: Option<QueueRecord> = self.db.select(("queue", name.as_str())).await?;
        if let Some(record) = existing {
            return Ok(record.state);
        }

        let record = QueueRecord {
            name: name.as_str().to_string(),
            state: QueueState::Running,
            updated_at: now.timestamp_millis(),
        };

        let created: Result<Option<QueueRecord>, surrealdb::Error> =
            self.db.create(("queue", name.as_str())).content(record).await;

        match created {
            Ok(Some(record)) => Ok(record.state),
            // Another scheduler created it first
            Ok(None) | Err(_) => self.get_state(name).await,
        }
    }

    /// Get a queue's operational state.
    pub async fn get_state(&self, name: QueueName) -> Result<QueueState, DbError> {
        let record: Option<QueueRecord> = self.db.select(("queue", name.as_str())).await?;

        record
            .map(|r| r.state)
            .ok_or_else(|| DbError::NotFound(format!("Queue not found: {}", name)))
    }

    /// Update a queue's state, returning the previous one.
    pub async fn set_state(
        &self,
        name: QueueName,
        state: QueueState,
        now: DateTime<Utc>,
    ) -> Result<QueueState, DbError> {
        let old_state = self.ensure(name, now).await?;

        let mut result = self
            .db
            .query("UPDATE type::thing('queue', $name) SET state = $state, updated_at = $now_ms RETURN AFTER")
            .bind(("name", name.as_str()))
            .bind(("state", state.as_str()))
            .bind(("now_ms", now.timestamp_millis()))
            .await?;

        let records: Vec<QueueRecord> = result.take(0)?;

        records
            .into_iter()
            .next()
            .map(|_| old_state)
            .ok_or_else(|| DbError::NotFound(format!("Queue not found: {}", name)))
    }
}
