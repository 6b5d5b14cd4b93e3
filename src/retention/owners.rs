//! Per-owner retention.
//!
//! When owners are configured, a run purges each active owner in turn with
//! that owner's retention period instead of one global pass.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{
    error::{PurgeError, StoreError, StoreResult},
    purger::{ArchiverOpts, ArchiverResults, BatchPurger, ExitReason, PurgeOutcome, panic_message},
    source::StaleQuery,
};
use crate::config::{OwnerPolicyConfig, days_to_duration};

/// Retention policy for one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerPolicy {
    pub enabled: bool,
    /// `None` falls back to the global retention period.
    pub max_age_days: Option<f64>,
}

/// Lists the owners to purge and their policies.
#[async_trait]
pub trait OwnerPolicySource: Send + Sync {
    async fn list_active_owners(&self) -> StoreResult<Vec<String>>;

    async fn policy(&self, owner_id: &str) -> StoreResult<OwnerPolicy>;
}

/// Owner policies from `[[retention.owners]]`.
#[derive(Debug, Clone, Default)]
pub struct StaticOwnerPolicies {
    owners: Vec<(String, OwnerPolicy)>,
}

impl StaticOwnerPolicies {
    pub fn from_config(owners: &[OwnerPolicyConfig]) -> Self {
        Self {
            owners: owners
                .iter()
                .map(|o| {
                    (
                        o.owner_id.clone(),
                        OwnerPolicy {
                            enabled: o.enabled,
                            max_age_days: o.max_age_days,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl OwnerPolicySource for StaticOwnerPolicies {
    async fn list_active_owners(&self) -> StoreResult<Vec<String>> {
        Ok(self.owners.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn policy(&self, owner_id: &str) -> StoreResult<OwnerPolicy> {
        self.owners
            .iter()
            .find(|(id, _)| id == owner_id)
            .map(|(_, policy)| policy.clone())
            .ok_or_else(|| StoreError::Other(format!("no retention policy for owner '{owner_id}'")))
    }
}

/// Purge every active owner with its own retention period.
///
/// `base` supplies batch size, pacing and safety settings, and the retention
/// period for owners without an override. Disabled owners and owners whose
/// policy cannot be read are skipped. Cancellation or a fatal purge error
/// stops the remaining owners. `max_deletes_per_run` is shared across all
/// owners.
pub async fn purge_owners(
    purger: &BatchPurger,
    cancel: &CancellationToken,
    owners: &dyn OwnerPolicySource,
    base: ArchiverOpts,
) -> PurgeOutcome {
    let start = tokio::time::Instant::now();
    let mut total = ArchiverResults::new(Utc::now());

    let error = match AssertUnwindSafe(owners_loop(purger, cancel, owners, base, &mut total))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "Owner retention panicked");
            total.exit_reason = ExitReason::Error;
            Some(PurgeError::Panicked(message))
        }
    };

    total.duration = start.elapsed();
    PurgeOutcome {
        results: total,
        error,
    }
}

async fn owners_loop(
    purger: &BatchPurger,
    cancel: &CancellationToken,
    owners: &dyn OwnerPolicySource,
    base: ArchiverOpts,
    total: &mut ArchiverResults,
) -> Result<(), PurgeError> {
    let owner_ids = match owners.list_active_owners().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list owners for retention");
            total.exit_reason = ExitReason::Error;
            return Err(PurgeError::Query(e));
        }
    };

    for owner_id in owner_ids {
        if cancel.is_cancelled() {
            total.exit_reason = ExitReason::Cancelled;
            break;
        }

        let policy = match owners.policy(&owner_id).await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!(owner_id, error = %e, "Cannot read owner retention policy, skipping");
                continue;
            }
        };

        if !policy.enabled {
            tracing::debug!(owner_id, "Retention disabled for owner, skipping");
            continue;
        }

        let mut opts = base.clone();
        if base.max_deletes_per_run > 0 {
            let processed = total.items_deleted + total.dry_run_matches;
            let remaining = base.max_deletes_per_run.saturating_sub(processed);
            if remaining == 0 {
                tracing::info!(
                    max_deletes_per_run = base.max_deletes_per_run,
                    "Reached max deletes for this run"
                );
                break;
            }
            opts.max_deletes_per_run = remaining;
        }
        opts.stale_query = StaleQuery {
            max_age: policy
                .max_age_days
                .map(days_to_duration)
                .unwrap_or(base.stale_query.max_age),
            owner_id: Some(owner_id.clone()),
        };

        let outcome = purger.run(cancel, opts).await;
        tracing::debug!(
            owner_id,
            items_deleted = outcome.results.items_deleted,
            exit_reason = %outcome.results.exit_reason,
            "Purged owner"
        );

        total.absorb(&outcome.results);
        if let Some(e) = outcome.error {
            return Err(e);
        }
        if outcome.results.exit_reason == ExitReason::Cancelled {
            break;
        }
    }

    Ok(())
}
