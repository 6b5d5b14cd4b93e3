use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CacheError, CacheResult};

/// Cluster-wide bookkeeping for a scheduled job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// When a run last completed on any node.
    pub last_finished: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobMetadataStore: Send + Sync {
    /// Load metadata for `key`. Unknown keys yield the default.
    async fn load(&self, key: &str) -> CacheResult<JobMetadata>;

    async fn store(&self, key: &str, metadata: &JobMetadata) -> CacheResult<()>;
}

/// [`JobMetadataStore`] persisted as JSON in the shared [`Cache`].
pub struct CacheMetadataStore {
    cache: Arc<dyn Cache>,
}

impl CacheMetadataStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn cache_key(key: &str) -> String {
        format!("job_metadata:{key}")
    }
}

#[async_trait]
impl JobMetadataStore for CacheMetadataStore {
    async fn load(&self, key: &str) -> CacheResult<JobMetadata> {
        match self.cache.get_bytes(&Self::cache_key(key)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CacheError::Deserialization(e.to_string())),
            None => Ok(JobMetadata::default()),
        }
    }

    async fn store(&self, key: &str, metadata: &JobMetadata) -> CacheResult<()> {
        let bytes =
            serde_json::to_vec(metadata).map_err(|e| CacheError::Serialization(e.to_string()))?;
        // No expiry: a weekly job must still see last week's run
        self.cache
            .set_bytes(&Self::cache_key(key), &bytes, Duration::ZERO)
            .await
    }
}
