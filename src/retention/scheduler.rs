//! Recurring jobs that run on exactly one node per tick.
//!
//! Each scheduled job is a tokio task that sleeps until the job is due,
//! takes the cluster lease, checks again under the lease that no peer ran
//! in the meantime, runs the body and records `last_finished`.
//! [`ClusterScheduler::run_exclusive`] runs one-off work under the same
//! lease.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{FutureExt, future::BoxFuture};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    lock::{ClusterMutex, Lease},
    metadata::{JobMetadata, JobMetadataStore},
    purger::panic_message,
};
use crate::{cache::CacheResult, observability::metrics};

/// Computes how long to wait before the next run from the current time and
/// the job's metadata. Zero means run now.
pub type NextWaitFn = Arc<dyn Fn(DateTime<Utc>, &JobMetadata) -> Duration + Send + Sync>;

/// The work performed on each tick. The token fires once the schedule is
/// closed.
pub type RunBody = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wall clock and timer can disagree slightly at wake-up.
const DUE_TOLERANCE: Duration = Duration::from_secs(1);

/// Delay before retrying after a contended lease or a store error.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Ran,
    NotDue,
    LeaseHeld,
    StoreError,
    Closed,
}

#[derive(Clone)]
pub struct ClusterScheduler {
    mutex: Arc<dyn ClusterMutex>,
    metadata: Arc<dyn JobMetadataStore>,
    lease_ttl: Duration,
    retry_interval: Duration,
}

impl ClusterScheduler {
    pub fn new(
        mutex: Arc<dyn ClusterMutex>,
        metadata: Arc<dyn JobMetadataStore>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            mutex,
            metadata,
            lease_ttl,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn metadata(&self) -> &Arc<dyn JobMetadataStore> {
        &self.metadata
    }

    /// Start the recurring job `key`. Must be called within a tokio runtime.
    pub fn schedule(&self, key: &str, next_wait: NextWaitFn, body: RunBody) -> ScheduledJob {
        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let task_key = key.to_string();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            scheduler
                .run_loop(&task_key, next_wait, body, task_cancel)
                .await;
        });

        tracing::debug!(key, "Scheduled cluster job");

        ScheduledJob {
            key: key.to_string(),
            cancel,
            handle: Some(handle),
        }
    }

    async fn run_loop(
        &self,
        key: &str,
        next_wait: NextWaitFn,
        body: RunBody,
        cancel: CancellationToken,
    ) {
        let mut retry_after: Option<Duration> = None;

        loop {
            let wait = match retry_after.take() {
                Some(wait) => wait,
                None => match self.metadata.load(key).await {
                    Ok(metadata) => next_wait(Utc::now(), &metadata),
                    Err(e) => {
                        tracing::error!(key, error = %e, "Failed to load job metadata");
                        metrics::record_tick_skipped("store_error");
                        self.retry_interval
                    }
                },
            };

            tracing::debug!(key, wait_secs = wait.as_secs(), "Waiting for next run");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.tick(key, &next_wait, &body, &cancel).await {
                TickOutcome::Ran | TickOutcome::NotDue | TickOutcome::Closed => {}
                TickOutcome::LeaseHeld | TickOutcome::StoreError => {
                    retry_after = Some(self.retry_interval);
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        tracing::debug!(key, "Cluster job loop exited");
    }

    /// Run `work` while holding the lease for `key`, renewing it until the
    /// work finishes.
    ///
    /// Returns `Ok(None)` without running anything if another holder has
    /// the lease. Does not touch the job's metadata.
    pub async fn run_exclusive<F>(&self, key: &str, work: F) -> CacheResult<Option<F::Output>>
    where
        F: Future,
    {
        let Some(lease) = self.mutex.try_acquire(key, self.lease_ttl).await? else {
            tracing::debug!(key, "Job lease held by another node");
            return Ok(None);
        };

        let output = self.with_renewal(&lease, work).await;

        if let Err(e) = self.mutex.release(&lease).await {
            tracing::warn!(key, error = %e, "Failed to release job lease");
        }
        Ok(Some(output))
    }

    async fn with_renewal<F>(&self, lease: &Lease, work: F) -> F::Output
    where
        F: Future,
    {
        let stop_renewal = CancellationToken::new();
        let renewal = tokio::spawn(keep_lease(
            Arc::clone(&self.mutex),
            lease.clone(),
            stop_renewal.clone(),
        ));
        let stop_on_unwind = stop_renewal.drop_guard();

        let output = work.await;

        drop(stop_on_unwind);
        if let Err(e) = renewal.await {
            tracing::warn!(key = %lease.key, error = %e, "Lease renewal task failed");
        }
        output
    }

    async fn tick(
        &self,
        key: &str,
        next_wait: &NextWaitFn,
        body: &RunBody,
        cancel: &CancellationToken,
    ) -> TickOutcome {
        let lease = match self.mutex.try_acquire(key, self.lease_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::debug!(key, "Job lease held by another node, skipping tick");
                metrics::record_tick_skipped("lease_held");
                return TickOutcome::LeaseHeld;
            }
            Err(e) => {
                tracing::error!(key, error = %e, "Failed to acquire job lease");
                metrics::record_tick_skipped("store_error");
                return TickOutcome::StoreError;
            }
        };

        let outcome = self
            .run_under_lease(key, &lease, next_wait, body, cancel)
            .await;

        if let Err(e) = self.mutex.release(&lease).await {
            tracing::warn!(key, error = %e, "Failed to release job lease");
        }

        outcome
    }

    async fn run_under_lease(
        &self,
        key: &str,
        lease: &Lease,
        next_wait: &NextWaitFn,
        body: &RunBody,
        cancel: &CancellationToken,
    ) -> TickOutcome {
        let metadata = match self.metadata.load(key).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::error!(key, error = %e, "Failed to load job metadata under lease");
                metrics::record_tick_skipped("store_error");
                return TickOutcome::StoreError;
            }
        };

        let wait = next_wait(Utc::now(), &metadata);
        if wait > DUE_TOLERANCE {
            tracing::debug!(
                key,
                wait_secs = wait.as_secs(),
                "Job already ran on another node, skipping tick"
            );
            metrics::record_tick_skipped("not_due");
            return TickOutcome::NotDue;
        }

        if cancel.is_cancelled() {
            tracing::debug!(key, "Schedule closed while acquiring lease, skipping tick");
            return TickOutcome::Closed;
        }

        let run = AssertUnwindSafe(body(cancel.clone())).catch_unwind();
        if let Err(panic) = self.with_renewal(lease, run).await {
            let message = panic_message(panic.as_ref());
            tracing::error!(key, panic = %message, "Scheduled job panicked");
        }

        let finished = JobMetadata {
            last_finished: Some(Utc::now()),
        };
        if let Err(e) = self.metadata.store(key, &finished).await {
            tracing::error!(key, error = %e, "Failed to store job metadata");
        }

        TickOutcome::Ran
    }
}

/// Renew `lease` every third of its TTL until `stop` fires or the lease is
/// lost.
async fn keep_lease(mutex: Arc<dyn ClusterMutex>, lease: Lease, stop: CancellationToken) {
    let period = (lease.ttl / 3).max(Duration::from_millis(100));

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }

        match mutex.renew(&lease).await {
            Ok(true) => tracing::trace!(key = %lease.key, "Renewed job lease"),
            Ok(false) => {
                tracing::warn!(key = %lease.key, "Lost job lease while running");
                return;
            }
            Err(e) => tracing::warn!(key = %lease.key, error = %e, "Failed to renew job lease"),
        }
    }
}

/// Handle to a scheduled job. Dropping it closes the schedule.
pub struct ScheduledJob {
    key: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledJob {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop scheduling further ticks. A tick already running is not
    /// interrupted.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Close and wait for the loop task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(key = %self.key, error = %e, "Cluster job task failed");
        }
    }
}

impl Drop for ScheduledJob {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
