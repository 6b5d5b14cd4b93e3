//! One purge pass over the stale records.
//!
//! The loop always reads page 0: every successful batch removes the records
//! it just read, so the next page 0 is the following batch. Dry runs delete
//! nothing and advance the page instead.

use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{
    error::PurgeError,
    source::{DeleteExecutor, StaleItemSource, StaleQuery},
};
use crate::{config::DEFAULT_BATCH_SIZE, observability::metrics};

/// Failed batches tolerated when none is configured.
pub const DEFAULT_MAX_FAILURES: u32 = 100;

/// Pause between batches when none is configured.
pub const DEFAULT_PACING: Duration = Duration::from_secs(5);

/// Called after every processed batch with the running totals.
pub type ProgressFn = Arc<dyn Fn(&ArchiverResults) + Send + Sync>;

/// Options for a single purge run.
#[derive(Clone)]
pub struct ArchiverOpts {
    pub stale_query: StaleQuery,
    pub batch_size: u32,
    /// 0 means [`DEFAULT_MAX_FAILURES`].
    pub max_failures: u32,
    pub pacing: Duration,
    pub dry_run: bool,
    /// 0 means unlimited.
    pub max_deletes_per_run: u64,
    pub on_progress: Option<ProgressFn>,
}

impl ArchiverOpts {
    pub fn new(stale_query: StaleQuery) -> Self {
        Self {
            stale_query,
            batch_size: DEFAULT_BATCH_SIZE,
            max_failures: DEFAULT_MAX_FAILURES,
            pacing: DEFAULT_PACING,
            dry_run: false,
            max_deletes_per_run: 0,
            on_progress: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_max_deletes(mut self, max_deletes_per_run: u64) -> Self {
        self.max_deletes_per_run = max_deletes_per_run;
        self
    }

    pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    fn effective_max_failures(&self) -> u32 {
        if self.max_failures == 0 {
            DEFAULT_MAX_FAILURES
        } else {
            self.max_failures
        }
    }
}

impl fmt::Debug for ArchiverOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiverOpts")
            .field("stale_query", &self.stale_query)
            .field("batch_size", &self.batch_size)
            .field("max_failures", &self.max_failures)
            .field("pacing", &self.pacing)
            .field("dry_run", &self.dry_run)
            .field("max_deletes_per_run", &self.max_deletes_per_run)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    Cancelled,
    Error,
}

impl ExitReason {
    /// Short label used for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::Cancelled => "cancelled",
            ExitReason::Error => "error",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExitReason::Completed => "completed normally",
            ExitReason::Cancelled => "canceled",
            ExitReason::Error => "error",
        })
    }
}

/// Totals for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiverResults {
    /// Records in processed batches. Batches whose delete failed but was
    /// tolerated are included.
    pub items_deleted: u64,
    pub failed_batches: u64,
    /// Records a dry run would have deleted.
    pub dry_run_matches: u64,
    pub exit_reason: ExitReason,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl ArchiverResults {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            items_deleted: 0,
            failed_batches: 0,
            dry_run_matches: 0,
            exit_reason: ExitReason::Completed,
            duration: Duration::ZERO,
            started_at,
        }
    }

    /// Fold another run's totals into these. A non-completed exit reason
    /// wins over `Completed`.
    pub fn absorb(&mut self, other: &ArchiverResults) {
        self.items_deleted += other.items_deleted;
        self.failed_batches += other.failed_batches;
        self.dry_run_matches += other.dry_run_matches;
        if other.exit_reason != ExitReason::Completed {
            self.exit_reason = other.exit_reason;
        }
    }
}

/// Results plus the error that ended the run, if any.
#[derive(Debug)]
pub struct PurgeOutcome {
    pub results: ArchiverResults,
    pub error: Option<PurgeError>,
}

impl PurgeOutcome {
    pub fn into_result(self) -> Result<ArchiverResults, PurgeError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.results),
        }
    }
}

/// Deletes stale records in paced batches.
#[derive(Clone)]
pub struct BatchPurger {
    source: Arc<dyn StaleItemSource>,
    executor: Arc<dyn DeleteExecutor>,
}

impl BatchPurger {
    pub fn new(source: Arc<dyn StaleItemSource>, executor: Arc<dyn DeleteExecutor>) -> Self {
        Self { source, executor }
    }

    /// Run one purge pass.
    ///
    /// Never panics and never returns early without results: a panic inside
    /// the loop is reported as [`PurgeError::Panicked`] with the partial
    /// totals kept.
    pub async fn run(&self, cancel: &CancellationToken, opts: ArchiverOpts) -> PurgeOutcome {
        let start = tokio::time::Instant::now();
        let mut results = ArchiverResults::new(Utc::now());

        let outcome = AssertUnwindSafe(self.purge_loop(cancel, &opts, &mut results))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(PurgeError::Panicked(panic_message(panic.as_ref()))),
        };

        if error.is_some() {
            results.exit_reason = ExitReason::Error;
        }
        results.duration = start.elapsed();

        PurgeOutcome { results, error }
    }

    async fn purge_loop(
        &self,
        cancel: &CancellationToken,
        opts: &ArchiverOpts,
        results: &mut ArchiverResults,
    ) -> Result<(), PurgeError> {
        let filter = opts.stale_query.filter_at(results.started_at);
        let batch_size = opts.batch_size.max(1) as usize;
        let max_failures = opts.effective_max_failures();
        let mut failures: u32 = 0;
        let mut page: usize = 0;

        tracing::debug!(
            older_than = %filter.older_than,
            owner_id = filter.owner_id.as_deref().unwrap_or("*"),
            batch_size,
            dry_run = opts.dry_run,
            "Removing stale records"
        );

        loop {
            let mut stale = match self.source.get_stale_page(&filter, page, batch_size).await {
                Ok(stale) => stale,
                Err(e) => {
                    tracing::error!(error = %e, page, "Cannot fetch stale records");
                    return Err(PurgeError::Query(e));
                }
            };

            let mut limit_reached = false;
            if opts.max_deletes_per_run > 0 {
                let processed = results.items_deleted + results.dry_run_matches;
                let remaining = opts.max_deletes_per_run.saturating_sub(processed);
                if stale.ids.len() as u64 >= remaining {
                    stale.ids.truncate(remaining as usize);
                    limit_reached = true;
                }
            }

            if !stale.ids.is_empty() {
                let count = stale.ids.len() as u64;

                if opts.dry_run {
                    tracing::info!(
                        count,
                        page,
                        first_id = %stale.ids[0],
                        "DRY RUN: Would delete stale records"
                    );
                    results.dry_run_matches += count;
                } else {
                    match self.executor.delete_batch(&stale.ids).await {
                        Ok(()) => metrics::record_retention_deletion(count),
                        Err(e) => {
                            failures += 1;
                            results.failed_batches += 1;
                            metrics::record_delete_failure();
                            tracing::warn!(
                                error = %e,
                                failures,
                                max_failures,
                                count,
                                "Cannot remove stale records"
                            );

                            if failures > max_failures {
                                return Err(PurgeError::TooManyFailures {
                                    failures,
                                    max_failures,
                                    last: e,
                                });
                            }
                        }
                    }
                    results.items_deleted += count;
                }

                if let Some(on_progress) = &opts.on_progress {
                    on_progress(results);
                }
            }

            if limit_reached {
                tracing::info!(
                    max_deletes_per_run = opts.max_deletes_per_run,
                    "Reached max deletes for this run"
                );
                return Ok(());
            }

            if !stale.has_more {
                return Ok(());
            }

            if opts.dry_run {
                page += 1;
            }

            tracing::info!(
                items_deleted = results.items_deleted,
                dry_run_matches = results.dry_run_matches,
                "Removing stale records"
            );

            // Let the store breathe between batches
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    results.exit_reason = ExitReason::Cancelled;
                    return Ok(());
                }
                _ = tokio::time::sleep(opts.pacing) => {}
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::retention::{
        error::{StoreError, StoreResult},
        source::{MemoryRecordStore, StaleFilter, StalePage},
    };

    /// Records batch sizes, optionally failing the first `fail_first`
    /// calls (or every call when `fail_always`).
    struct RecordingExecutor {
        inner: Arc<MemoryRecordStore>,
        batches: Mutex<Vec<usize>>,
        fail_first: AtomicU32,
        fail_always: bool,
    }

    impl RecordingExecutor {
        fn new(inner: Arc<MemoryRecordStore>) -> Self {
            Self {
                inner,
                batches: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(0),
                fail_always: false,
            }
        }

        fn failing_first(inner: Arc<MemoryRecordStore>, n: u32) -> Self {
            let executor = Self::new(inner);
            executor.fail_first.store(n, Ordering::SeqCst);
            executor
        }

        fn always_failing(inner: Arc<MemoryRecordStore>) -> Self {
            Self {
                fail_always: true,
                ..Self::new(inner)
            }
        }
    }

    #[async_trait]
    impl DeleteExecutor for RecordingExecutor {
        async fn delete_batch(&self, ids: &[String]) -> StoreResult<()> {
            self.batches.lock().push(ids.len());
            if self.fail_always {
                return Err(StoreError::Unavailable("delete rejected".into()));
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("transient".into()));
            }
            self.inner.delete_batch(ids).await
        }
    }

    struct FailingSource;

    #[async_trait]
    impl StaleItemSource for FailingSource {
        async fn get_stale_page(
            &self,
            _filter: &StaleFilter,
            _page: usize,
            _page_size: usize,
        ) -> StoreResult<StalePage> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl StaleItemSource for PanickingSource {
        async fn get_stale_page(
            &self,
            _filter: &StaleFilter,
            _page: usize,
            _page_size: usize,
        ) -> StoreResult<StalePage> {
            panic!("source exploded");
        }
    }

    fn seeded_store(n: usize) -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        let old = Utc::now() - chrono::Duration::days(400);
        for i in 0..n {
            store.insert(format!("rec-{i:04}"), None, old);
        }
        store
    }

    fn opts(batch_size: u32) -> ArchiverOpts {
        ArchiverOpts::new(StaleQuery {
            max_age: chrono::Duration::days(365),
            owner_id: None,
        })
        .with_batch_size(batch_size)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_in_three_batches() {
        let store = seeded_store(120);
        let executor = Arc::new(RecordingExecutor::new(store.clone()));
        let purger = BatchPurger::new(store.clone(), executor.clone());

        let outcome = purger.run(&CancellationToken::new(), opts(50)).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.results.items_deleted, 120);
        assert_eq!(outcome.results.exit_reason, ExitReason::Completed);
        assert_eq!(*executor.batches.lock(), vec![50, 50, 20]);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_batches() {
        let store = seeded_store(120);
        let purger = BatchPurger::new(store.clone(), store.clone());

        let outcome = purger
            .run(
                &CancellationToken::new(),
                opts(50).with_pacing(Duration::from_secs(5)),
            )
            .await;

        // Two pauses between three batches
        assert_eq!(outcome.results.duration, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_pacing() {
        let store = seeded_store(120);
        let purger = BatchPurger::new(store.clone(), store.clone());
        let cancel = CancellationToken::new();

        let on_progress: ProgressFn = {
            let cancel = cancel.clone();
            Arc::new(move |_| cancel.cancel())
        };
        let outcome = purger
            .run(&cancel, opts(50).with_progress(on_progress))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.results.exit_reason, ExitReason::Cancelled);
        assert_eq!(outcome.results.items_deleted, 50);
        assert_eq!(store.len(), 70);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_failure_aborts_with_limit_two() {
        let store = seeded_store(25);
        let executor = Arc::new(RecordingExecutor::always_failing(store.clone()));
        let purger = BatchPurger::new(store.clone(), executor.clone());

        let outcome = purger.run(&CancellationToken::new(), opts(10).with_max_failures(2)).await;

        assert_eq!(outcome.results.exit_reason, ExitReason::Error);
        assert!(matches!(
            outcome.error,
            Some(PurgeError::TooManyFailures {
                failures: 3,
                max_failures: 2,
                ..
            })
        ));
        assert_eq!(outcome.results.failed_batches, 3);
        // The two tolerated batches are still counted
        assert_eq!(outcome.results.items_deleted, 20);
        assert_eq!(executor.batches.lock().len(), 3);
        assert_eq!(store.len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_completes() {
        let store = seeded_store(25);
        let executor = Arc::new(RecordingExecutor::failing_first(store.clone(), 2));
        let purger = BatchPurger::new(store.clone(), executor.clone());

        let outcome = purger.run(&CancellationToken::new(), opts(10).with_max_failures(2)).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.results.exit_reason, ExitReason::Completed);
        assert_eq!(outcome.results.failed_batches, 2);
        assert_eq!(outcome.results.items_deleted, 45);
        assert_eq!(*executor.batches.lock(), vec![10, 10, 10, 10, 5]);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_failures_uses_default() {
        let store = seeded_store(25);
        let executor = Arc::new(RecordingExecutor::failing_first(store.clone(), 5));
        let purger = BatchPurger::new(store.clone(), executor);

        let outcome = purger.run(&CancellationToken::new(), opts(10).with_max_failures(0)).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.results.failed_batches, 5);
    }

    #[tokio::test]
    async fn test_query_error_aborts() {
        let store = seeded_store(10);
        let purger = BatchPurger::new(Arc::new(FailingSource), store.clone());

        let outcome = purger.run(&CancellationToken::new(), opts(10)).await;

        assert_eq!(outcome.results.exit_reason, ExitReason::Error);
        assert_eq!(outcome.results.items_deleted, 0);
        assert!(matches!(outcome.error, Some(PurgeError::Query(_))));
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let store = seeded_store(1);
        let purger = BatchPurger::new(Arc::new(PanickingSource), store);

        let outcome = purger.run(&CancellationToken::new(), opts(10)).await;

        assert_eq!(outcome.results.exit_reason, ExitReason::Error);
        match outcome.into_result() {
            Err(PurgeError::Panicked(msg)) => assert!(msg.contains("source exploded")),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_deletes_truncates_final_batch() {
        let store = seeded_store(120);
        let executor = Arc::new(RecordingExecutor::new(store.clone()));
        let purger = BatchPurger::new(store.clone(), executor.clone());

        let outcome = purger
            .run(&CancellationToken::new(), opts(50).with_max_deletes(70))
            .await;

        assert_eq!(outcome.results.exit_reason, ExitReason::Completed);
        assert_eq!(outcome.results.items_deleted, 70);
        assert_eq!(*executor.batches.lock(), vec![50, 20]);
        assert_eq!(store.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_deletes_nothing() {
        let store = seeded_store(25);
        let executor = Arc::new(RecordingExecutor::new(store.clone()));
        let purger = BatchPurger::new(store.clone(), executor.clone());

        let outcome = purger
            .run(&CancellationToken::new(), opts(10).with_dry_run(true))
            .await;

        assert_eq!(outcome.results.exit_reason, ExitReason::Completed);
        assert_eq!(outcome.results.dry_run_matches, 25);
        assert_eq!(outcome.results.items_deleted, 0);
        assert!(executor.batches.lock().is_empty());
        assert_eq!(store.len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_called_per_batch() {
        let store = seeded_store(120);
        let purger = BatchPurger::new(store.clone(), store.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let on_progress: ProgressFn = {
            let calls = calls.clone();
            let seen = seen.clone();
            Arc::new(move |r: &ArchiverResults| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(r.items_deleted);
            })
        };
        purger
            .run(&CancellationToken::new(), opts(50).with_progress(on_progress))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock(), vec![50, 100, 120]);
    }

    #[tokio::test]
    async fn test_empty_store_completes_immediately() {
        let store = Arc::new(MemoryRecordStore::new());
        let purger = BatchPurger::new(store.clone(), store);

        let results = purger
            .run(&CancellationToken::new(), opts(50))
            .await
            .into_result()
            .unwrap();
        assert_eq!(results.items_deleted, 0);
        assert_eq!(results.exit_reason, ExitReason::Completed);
    }

    #[test]
    fn test_exit_reason_strings() {
        assert_eq!(ExitReason::Completed.to_string(), "completed normally");
        assert_eq!(ExitReason::Cancelled.to_string(), "canceled");
        assert_eq!(ExitReason::Error.as_label(), "error");
    }
}
