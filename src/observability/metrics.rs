//! Prometheus metrics for the sweeper.
//!
//! Provides metrics for:
//! - Retention runs by exit reason and their duration
//! - Records deleted and failed delete batches
//! - Scheduler ticks skipped because a peer holds the lease or already ran

#[cfg(feature = "prometheus")]
use std::net::SocketAddr;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Install the Prometheus recorder and start its scrape endpoint.
///
/// Must be called from within a tokio runtime.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.listen_addr.parse().map_err(|e| {
        MetricsError::Setup(format!(
            "invalid metrics listen_addr '{}': {e}",
            config.listen_addr
        ))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &config.duration_buckets_secs,
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?
        .install()?;

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record a finished retention run.
///
/// # Arguments
/// * `exit_reason` - `"completed"`, `"cancelled"` or `"error"`
/// * `duration_secs` - Wall time of the run
pub fn record_run(exit_reason: &str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("retention_runs_total", "exit_reason" => exit_reason.to_string()).increment(1);
        histogram!("retention_run_duration_seconds").record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (exit_reason, duration_secs);
    }
}

/// Record records deleted by a retention batch.
pub fn record_retention_deletion(count: u64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("retention_deletions_total").increment(count);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = count;
    }
}

/// Record a delete batch that failed.
pub fn record_delete_failure() {
    #[cfg(feature = "prometheus")]
    {
        counter!("retention_delete_failures_total").increment(1);
    }
}

/// Record a scheduler tick that did not run the job.
///
/// # Arguments
/// * `reason` - `"lease_held"`, `"not_due"` or `"store_error"`
pub fn record_tick_skipped(reason: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("retention_tick_skipped_total", "reason" => reason.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = reason;
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
