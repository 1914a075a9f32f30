//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes. It is idempotent,
/// so restarted processes call it against existing data.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    // Queue table
    db.query(QUEUE_SCHEMA).await?.check()?;

    // Job table
    db.query(JOB_SCHEMA).await?.check()?;

    // Dedupe locks for enqueue_unique
    db.query(DEDUPE_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Queue table schema.
const QUEUE_SCHEMA: &str = r#"
-- Operational state per queue; configuration is static and not stored
DEFINE TABLE IF NOT EXISTS queue SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS name ON queue TYPE string;
DEFINE FIELD IF NOT EXISTS state ON queue TYPE string DEFAULT "running";
DEFINE FIELD IF NOT EXISTS updated_at ON queue TYPE int;

DEFINE INDEX IF NOT EXISTS queue_name ON queue FIELDS name UNIQUE;
"#;

/// Job table schema. Timestamps are epoch milliseconds.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS queue ON job TYPE string;
DEFINE FIELD IF NOT EXISTS job_type ON job TYPE string;
DEFINE FIELD IF NOT EXISTS payload ON job FLEXIBLE TYPE object;
DEFINE FIELD IF NOT EXISTS priority ON job TYPE int;
DEFINE FIELD IF NOT EXISTS state ON job TYPE string;
DEFINE FIELD IF NOT EXISTS run_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS attempts ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS max_attempts ON job TYPE int;
DEFINE FIELD IF NOT EXISTS last_error ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS dedupe_key ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS claim_token ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS worker_id ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS claimed_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS claim_expires_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS manual_retries ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS finished_at ON job TYPE option<int>;

DEFINE INDEX IF NOT EXISTS job_state ON job FIELDS queue, state;
DEFINE INDEX IF NOT EXISTS job_dispatch ON job FIELDS queue, job_type, state, priority, created_at;
DEFINE INDEX IF NOT EXISTS job_due ON job FIELDS queue, state, run_at;
DEFINE INDEX IF NOT EXISTS job_claim_expiry ON job FIELDS queue, state, claim_expires_at;
DEFINE INDEX IF NOT EXISTS job_finished ON job FIELDS queue, state, finished_at;
"#;

/// Dedupe lock table. Record id is `<queue>/<key>`; creation fails if held.
const DEDUPE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_dedupe SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job_dedupe TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON job_dedupe TYPE int;
"#;
