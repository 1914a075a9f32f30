//! SurrealDB-backed durable store for the job scheduler.
//!
//! This crate provides database connectivity and repositories for
//! persisting job records and queue state. Every state transition is a
//! single conditional update, so concurrent schedulers sharing one
//! database never hand the same job to two workers.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use repositories::{
    ClaimRequest, FailureReport, JobRepository, QueueRepository, Reclaimed, RetryOutcome,
    STALE_CLAIM_ERROR,
};
pub use schema::init_schema;

/// Connect and initialize the schema.
///
/// This should be called once at application startup.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
