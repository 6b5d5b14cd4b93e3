//! Scheduled purging of stale records.
//!
//! A [`RetentionJob`] runs on a weekly or daily cadence. Every tick is
//! claimed by exactly one node through a lease in the shared cache, and
//! within a process a [`SingleFlightGuard`] keeps runs from overlapping.
//! Each run is a [`BatchPurger`] pass: page through stale record ids, delete
//! them in batches and pause between batches.

pub mod cadence;
mod error;
mod guard;
mod job;
mod lock;
mod metadata;
mod owners;
mod purger;
mod scheduler;
pub mod source;

use std::sync::Arc;

pub use cadence::{Frequency, TimeOfDay, wait_until};
pub use error::{PurgeError, RetentionError, StopError, StoreError, StoreResult};
pub use guard::{RunHandle, SingleFlightGuard};
pub use job::{RETENTION_JOB_KEY, RetentionJob, next_wait_interval};
pub use lock::{CacheClusterMutex, ClusterMutex, Lease};
pub use metadata::{CacheMetadataStore, JobMetadata, JobMetadataStore};
pub use owners::{OwnerPolicy, OwnerPolicySource, StaticOwnerPolicies, purge_owners};
pub use purger::{
    ArchiverOpts, ArchiverResults, BatchPurger, DEFAULT_MAX_FAILURES, DEFAULT_PACING, ExitReason,
    ProgressFn, PurgeOutcome,
};
pub use scheduler::{ClusterScheduler, NextWaitFn, RunBody, ScheduledJob};
#[cfg(feature = "database-sqlite")]
pub use source::SqliteRecordStore;
pub use source::{
    DeleteExecutor, MemoryRecordStore, StaleFilter, StaleItemSource, StalePage, StaleQuery,
};

use crate::{
    cache::create_cache,
    config::{DatabaseConfig, SweeperConfig},
};

/// Build the retention job from configuration: the shared cache for leases
/// and job metadata, and the configured record store.
pub async fn build_retention_job(config: &SweeperConfig) -> Result<RetentionJob, RetentionError> {
    let cache = create_cache(&config.cache).await?;

    let scheduler = ClusterScheduler::new(
        Arc::new(CacheClusterMutex::new(cache.clone())),
        Arc::new(CacheMetadataStore::new(cache)),
        config.retention.lock_ttl(),
    );

    let purger = match &config.database {
        DatabaseConfig::None => {
            tracing::warn!("No record database configured, purging an empty in-memory store");
            let store = Arc::new(MemoryRecordStore::new());
            BatchPurger::new(store.clone(), store)
        }
        #[cfg(feature = "database-sqlite")]
        DatabaseConfig::Sqlite(sqlite) => {
            let store = Arc::new(SqliteRecordStore::from_config(sqlite).await?);
            tracing::info!(path = %sqlite.path, table = %sqlite.table.name, "Using SQLite record store");
            BatchPurger::new(store.clone(), store)
        }
    };

    Ok(RetentionJob::new(config.retention.clone(), scheduler, purger))
}
