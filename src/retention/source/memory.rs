use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{DeleteExecutor, StaleFilter, StaleItemSource, StalePage};
use crate::retention::error::StoreResult;

#[derive(Debug, Clone)]
struct StoredRecord {
    owner_id: Option<String>,
    updated_at: DateTime<Utc>,
    soft_deleted: bool,
}

/// In-process record store keyed by id.
///
/// Implements both [`StaleItemSource`] and [`DeleteExecutor`], so a single
/// `Arc<MemoryRecordStore>` can be handed to the purger for both roles.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        id: impl Into<String>,
        owner_id: Option<&str>,
        updated_at: DateTime<Utc>,
    ) {
        self.records.lock().insert(
            id.into(),
            StoredRecord {
                owner_id: owner_id.map(str::to_string),
                updated_at,
                soft_deleted: false,
            },
        );
    }

    /// Mark a record as already deleted. Stale queries skip it.
    pub fn soft_delete(&self, id: &str) -> bool {
        match self.records.lock().get_mut(id) {
            Some(record) => {
                record.soft_deleted = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl StaleItemSource for MemoryRecordStore {
    async fn get_stale_page(
        &self,
        filter: &StaleFilter,
        page: usize,
        page_size: usize,
    ) -> StoreResult<StalePage> {
        let records = self.records.lock();
        let candidates = records
            .iter()
            .filter(|(_, r)| !r.soft_deleted && r.updated_at < filter.older_than)
            .filter(|(_, r)| match &filter.owner_id {
                Some(owner) => r.owner_id.as_deref() == Some(owner.as_str()),
                None => true,
            })
            .map(|(id, _)| id.clone());

        let ids: Vec<String> = if page_size == 0 {
            candidates.collect()
        } else {
            candidates
                .skip(page.saturating_mul(page_size))
                .take(page_size + 1)
                .collect()
        };

        Ok(StalePage::from_peek(ids, page_size))
    }
}

#[async_trait]
impl DeleteExecutor for MemoryRecordStore {
    async fn delete_batch(&self, ids: &[String]) -> StoreResult<()> {
        let mut records = self.records.lock();
        for id in ids {
            records.remove(id);
        }
        Ok(())
    }
}
