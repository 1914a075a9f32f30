//! Process configuration from the environment.

use std::env;
use std::num::ParseIntError;
use std::time::Duration;

use jobs_core::SchedulerConfig;
use jobs_db::DbConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be an integer: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("JOBS_DB_USER and JOBS_DB_PASS must be set together")]
    PartialCredentials,
}

/// Everything `main` needs to boot.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: DbConfig,
    pub scheduler: SchedulerConfig,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn number(name: &'static str) -> Result<Option<u64>, ConfigError> {
    var(name)
        .map(|value| value.trim().parse::<u64>())
        .transpose()
        .map_err(|source| ConfigError::Invalid { name, source })
}

impl ServerConfig {
    /// `JOBS_DB_ENDPOINT` accepts `mem://` and, when built with the
    /// `rocksdb` feature, `rocksdb://<path>`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut db = DbConfig::endpoint(var("JOBS_DB_ENDPOINT").unwrap_or_else(|| "mem://".into()));
        if let Some(namespace) = var("JOBS_DB_NAMESPACE") {
            db = db.with_namespace(namespace);
        }
        if let Some(database) = var("JOBS_DB_DATABASE") {
            db = db.with_database(database);
        }
        match (var("JOBS_DB_USER"), var("JOBS_DB_PASS")) {
            (Some(user), Some(pass)) => db = db.with_credentials(user, pass),
            (None, None) => {}
            _ => return Err(ConfigError::PartialCredentials),
        }

        let mut scheduler = SchedulerConfig::standard();
        if let Some(ms) = number("JOBS_TICK_MS")? {
            scheduler = scheduler.with_tick_interval(Duration::from_millis(ms.max(1)));
        }
        if let Some(secs) = number("JOBS_STALE_GRACE_SECS")? {
            for queue in scheduler.queues.values_mut() {
                queue.stale_grace = Duration::from_secs(secs);
            }
        }

        Ok(Self { db, scheduler })
    }
}
