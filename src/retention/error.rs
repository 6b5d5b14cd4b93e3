use std::time::Duration;

use thiserror::Error;

use crate::{cache::CacheError, config::SettingsError};

/// Failure from a stale item source or delete executor.
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "database-sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Why a purge run ended early.
#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("failed to fetch stale records: {0}")]
    Query(#[source] StoreError),

    #[error("too many delete failures ({failures}, limit {max_failures}): {last}")]
    TooManyFailures {
        failures: u32,
        max_failures: u32,
        #[source]
        last: StoreError,
    },

    #[error("purge run panicked: {0}")]
    Panicked(String),
}

/// A run did not stop in time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("waiting on job to stop timed out after {0:?}")]
    Timeout(Duration),
}

/// Retention job errors.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("invalid retention settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("error stopping retention job: {}", .0.join("; "))]
    Stop(Vec<String>),

    #[error("lease '{0}' is held by another node")]
    LeaseHeld(String),

    #[error("retention store error: {0}")]
    Cache(#[from] CacheError),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}
