//! The retention job driver.
//!
//! [`RetentionJob`] owns the current configuration and wires the settings,
//! the run guard, the purger and the cluster schedule together.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{
    error::RetentionError,
    guard::{RunHandle, SingleFlightGuard},
    metadata::JobMetadata,
    owners::{OwnerPolicySource, StaticOwnerPolicies, purge_owners},
    purger::{ArchiverOpts, BatchPurger, ExitReason, PurgeOutcome},
    scheduler::{ClusterScheduler, NextWaitFn, RunBody, ScheduledJob},
    source::StaleQuery,
};
use crate::{
    config::{RetentionConfig, RetentionJobSettings, clamp_batch_size},
    observability::metrics,
    retention::cadence::wait_until,
};

/// Cluster-wide name of the retention schedule.
pub const RETENTION_JOB_KEY: &str = "stale_sweeper_retention_job";

/// Time until the next run for `settings`, given the cluster metadata.
pub fn next_wait_interval(
    settings: &RetentionJobSettings,
    now: DateTime<Utc>,
    metadata: &JobMetadata,
) -> Duration {
    let next = settings.frequency.next_run(
        metadata.last_finished,
        settings.day_of_week,
        &settings.time_of_day,
        now,
    );
    wait_until(next, now)
}

struct JobInner {
    config: RwLock<Arc<RetentionConfig>>,
    scheduler: ClusterScheduler,
    purger: BatchPurger,
    owner_source: Option<Arc<dyn OwnerPolicySource>>,
    guard: SingleFlightGuard,
    schedule: Mutex<Option<ScheduledJob>>,
}

/// Scheduled, cluster-exclusive purge of stale records.
///
/// Cheap to clone; clones share the schedule and the run guard.
#[derive(Clone)]
pub struct RetentionJob {
    inner: Arc<JobInner>,
}

impl RetentionJob {
    pub fn new(config: RetentionConfig, scheduler: ClusterScheduler, purger: BatchPurger) -> Self {
        Self::build(config, scheduler, purger, None)
    }

    /// Use `owners` instead of the configured `[[retention.owners]]`.
    pub fn with_owner_source(
        config: RetentionConfig,
        scheduler: ClusterScheduler,
        purger: BatchPurger,
        owners: Arc<dyn OwnerPolicySource>,
    ) -> Self {
        Self::build(config, scheduler, purger, Some(owners))
    }

    fn build(
        config: RetentionConfig,
        scheduler: ClusterScheduler,
        purger: BatchPurger,
        owner_source: Option<Arc<dyn OwnerPolicySource>>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                config: RwLock::new(Arc::new(config)),
                scheduler,
                purger,
                owner_source,
                guard: SingleFlightGuard::new(),
                schedule: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> Arc<RetentionConfig> {
        self.inner.config.read().clone()
    }

    /// Resolve settings and schedule the job. A disabled job is left
    /// unscheduled. Starting an already scheduled job does nothing.
    pub fn start(&self) -> Result<(), RetentionError> {
        let settings = self.config().job_settings()?;

        if !settings.enabled {
            tracing::info!("Retention job disabled by configuration");
            return Ok(());
        }

        let mut schedule = self.inner.schedule.lock();
        if schedule.is_some() {
            tracing::debug!("Retention job already scheduled");
            return Ok(());
        }

        tracing::info!(settings = %settings, "Scheduling retention job");

        let next_wait: NextWaitFn =
            Arc::new(move |now: DateTime<Utc>, metadata: &JobMetadata| {
                next_wait_interval(&settings, now, metadata)
            });

        let job = Arc::downgrade(&self.inner);
        let body: RunBody = Arc::new(move |closed: CancellationToken| {
            let job = job.clone();
            async move {
                if let Some(inner) = job.upgrade() {
                    RetentionJob { inner }.run_scheduled(&closed).await;
                }
            }
            .boxed()
        });

        *schedule = Some(
            self.inner
                .scheduler
                .schedule(RETENTION_JOB_KEY, next_wait, body),
        );
        Ok(())
    }

    /// Close the schedule and stop the active run, waiting up to `timeout`
    /// each for the run and for the schedule's task to exit.
    ///
    /// Once this returns `Ok`, no run started under the old schedule is
    /// left.
    pub async fn stop(&self, timeout: Duration) -> Result<(), RetentionError> {
        let mut errors = Vec::new();

        let schedule = self.inner.schedule.lock().take();
        if let Some(schedule) = &schedule {
            tracing::debug!(key = schedule.key(), "Closing retention schedule");
            schedule.close();
        }

        if let Err(e) = self.inner.guard.stop(timeout).await {
            errors.push(e.to_string());
        }

        if let Some(schedule) = schedule {
            let key = schedule.key().to_string();
            if tokio::time::timeout(timeout, schedule.shutdown())
                .await
                .is_err()
            {
                errors.push(format!("schedule '{key}' did not exit within {timeout:?}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RetentionError::Stop(errors))
        }
    }

    /// Apply a new configuration: stop, swap, start.
    ///
    /// The stop waits up to the current configuration's `stop_timeout_secs`.
    /// If the new settings are invalid the job stays stopped and the error
    /// is returned.
    pub async fn on_configuration_change(
        &self,
        config: RetentionConfig,
    ) -> Result<(), RetentionError> {
        let timeout = self.config().stop_timeout();
        if let Err(e) = self.stop(timeout).await {
            tracing::error!(error = %e, "Failed to stop retention job for configuration change");
        }

        *self.inner.config.write() = Arc::new(config);
        self.start()
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner
            .schedule
            .lock()
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    pub fn is_running(&self) -> bool {
        self.inner.guard.is_running()
    }

    /// When the schedule will next fire, or `None` if the job is disabled.
    pub async fn next_scheduled_run(&self) -> Result<Option<DateTime<Utc>>, RetentionError> {
        let settings = self.config().job_settings()?;
        if !settings.enabled {
            return Ok(None);
        }

        let metadata = self
            .inner
            .scheduler
            .metadata()
            .load(RETENTION_JOB_KEY)
            .await?;

        Ok(Some(settings.frequency.next_run(
            metadata.last_finished,
            settings.day_of_week,
            &settings.time_of_day,
            Utc::now(),
        )))
    }

    /// Run one purge pass now under the cluster lease, outside the
    /// schedule. The schedule's `last_finished` is left alone.
    ///
    /// Fails with [`RetentionError::LeaseHeld`] while another node holds
    /// the lease. Returns `Ok(None)` when another run is already active in
    /// this process.
    pub async fn run_now(&self) -> Result<Option<PurgeOutcome>, RetentionError> {
        self.inner
            .scheduler
            .run_exclusive(RETENTION_JOB_KEY, self.run_job())
            .await?
            .ok_or_else(|| RetentionError::LeaseHeld(RETENTION_JOB_KEY.to_string()))
    }

    /// Run one purge pass now in this process only, without the cluster
    /// lease.
    ///
    /// Returns `None` when another run is already active in this process.
    pub async fn run_job(&self) -> Option<PurgeOutcome> {
        let handle = self.inner.guard.start()?;
        Some(self.run_with(handle).await)
    }

    /// Body of a scheduled tick. A schedule closed before the run could
    /// claim the guard runs nothing.
    async fn run_scheduled(&self, closed: &CancellationToken) {
        let Some(handle) = self.inner.guard.start() else {
            tracing::warn!("Retention run already active, skipping scheduled tick");
            return;
        };
        if closed.is_cancelled() {
            tracing::debug!("Retention schedule closed, skipping run");
            return;
        }
        self.run_with(handle).await;
    }

    async fn run_with(&self, handle: RunHandle) -> PurgeOutcome {
        let config = self.config();
        let dry_run = config.safety.dry_run;

        let opts = ArchiverOpts::new(StaleQuery {
            max_age: config.max_age(),
            owner_id: None,
        })
        .with_batch_size(clamp_batch_size(config.batch_size))
        .with_max_failures(config.max_failures)
        .with_pacing(config.pacing())
        .with_dry_run(dry_run)
        .with_max_deletes(config.safety.max_deletes_per_run);

        tracing::info!(
            run_id = handle.id(),
            max_age_days = config.max_age_days,
            batch_size = opts.batch_size,
            dry_run,
            "Retention run started"
        );

        let cancel = handle.cancellation_token().clone();
        let outcome = match self.owner_source(&config) {
            Some(owners) => {
                purge_owners(&self.inner.purger, &cancel, owners.as_ref(), opts).await
            }
            None => self.inner.purger.run(&cancel, opts).await,
        };
        drop(handle);

        let results = &outcome.results;
        metrics::record_run(results.exit_reason.as_label(), results.duration.as_secs_f64());

        match (&outcome.error, results.exit_reason) {
            (Some(e), _) => tracing::error!(
                error = %e,
                items_deleted = results.items_deleted,
                failed_batches = results.failed_batches,
                duration_secs = results.duration.as_secs_f64(),
                "Retention run failed"
            ),
            (None, ExitReason::Cancelled) => tracing::info!(
                items_deleted = results.items_deleted,
                duration_secs = results.duration.as_secs_f64(),
                "Retention run cancelled"
            ),
            (None, _) if dry_run => tracing::info!(
                would_delete = results.dry_run_matches,
                duration_secs = results.duration.as_secs_f64(),
                "Retention run complete (DRY RUN)"
            ),
            (None, _) => tracing::info!(
                items_deleted = results.items_deleted,
                failed_batches = results.failed_batches,
                duration_secs = results.duration.as_secs_f64(),
                exit_reason = %results.exit_reason,
                "Retention run complete"
            ),
        }

        outcome
    }

    fn owner_source(&self, config: &RetentionConfig) -> Option<Arc<dyn OwnerPolicySource>> {
        if let Some(source) = &self.inner.owner_source {
            return Some(source.clone());
        }
        if config.owners.is_empty() {
            return None;
        }
        Some(Arc::new(StaticOwnerPolicies::from_config(&config.owners)))
    }
}
