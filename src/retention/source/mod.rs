//! Where stale records come from and how they are deleted.
//!
//! The purge loop only depends on the two traits here. [`MemoryRecordStore`]
//! backs tests and single-process setups; `SqliteRecordStore` reads a
//! configured table behind the `database-sqlite` feature.

mod memory;
#[cfg(feature = "database-sqlite")]
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::MemoryRecordStore;
#[cfg(feature = "database-sqlite")]
pub use sqlite::SqliteRecordStore;

use super::error::StoreResult;

/// What a run purges: records older than `max_age`, optionally limited to
/// one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleQuery {
    pub max_age: chrono::Duration,
    pub owner_id: Option<String>,
}

impl StaleQuery {
    /// Fix the cutoff for a run starting at `now`. An age reaching past the
    /// earliest representable instant saturates to it.
    pub fn filter_at(&self, now: DateTime<Utc>) -> StaleFilter {
        StaleFilter {
            older_than: now
                .checked_sub_signed(self.max_age)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            owner_id: self.owner_id.clone(),
        }
    }
}

/// A resolved stale query with an absolute cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleFilter {
    /// Records last updated strictly before this instant are stale.
    pub older_than: DateTime<Utc>,
    pub owner_id: Option<String>,
}

/// One page of stale record ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalePage {
    pub ids: Vec<String>,
    pub has_more: bool,
}

impl StalePage {
    /// Build a page from up to `page_size + 1` ids. The extra id only
    /// signals that another page exists and is dropped.
    ///
    /// A `page_size` of 0 means unpaged: every id is kept.
    pub fn from_peek(mut ids: Vec<String>, page_size: usize) -> Self {
        let has_more = page_size > 0 && ids.len() > page_size;
        if has_more {
            ids.truncate(page_size);
        }
        Self { ids, has_more }
    }
}

/// Paginated query for stale record ids.
///
/// Ids come back in stable id order. `page` is zero-based and skips
/// `page * page_size` candidates.
#[async_trait]
pub trait StaleItemSource: Send + Sync {
    async fn get_stale_page(
        &self,
        filter: &StaleFilter,
        page: usize,
        page_size: usize,
    ) -> StoreResult<StalePage>;
}

/// Bulk delete of records by id. Deleting an id that no longer exists is
/// not an error.
#[async_trait]
pub trait DeleteExecutor: Send + Sync {
    async fn delete_batch(&self, ids: &[String]) -> StoreResult<()>;
}
