//! Cluster-wide mutual exclusion for scheduled ticks.
//!
//! A lease is a key in the shared store holding a random owner token. Only
//! the holder of the token can renew or release it, and an abandoned lease
//! expires on its own after its TTL.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use uuid::Uuid;

use crate::cache::{Cache, CacheResult};

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

#[async_trait]
pub trait ClusterMutex: Send + Sync {
    /// Try to take the lease for `key`. `None` if another holder has it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> CacheResult<Option<Lease>>;

    /// Extend the lease. Returns false if it was lost (expired or taken).
    async fn renew(&self, lease: &Lease) -> CacheResult<bool>;

    /// Give the lease back. Releasing a lost lease is a no-op.
    async fn release(&self, lease: &Lease) -> CacheResult<()>;
}

/// [`ClusterMutex`] over the shared [`Cache`].
pub struct CacheClusterMutex {
    cache: Arc<dyn Cache>,
}

impl CacheClusterMutex {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn cache_key(key: &str) -> String {
        format!("mutex:{key}")
    }
}

#[async_trait]
impl ClusterMutex for CacheClusterMutex {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> CacheResult<Option<Lease>> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .cache
            .set_nx(&Self::cache_key(key), token.as_bytes(), ttl)
            .await?;

        Ok(acquired.then(|| Lease {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    async fn renew(&self, lease: &Lease) -> CacheResult<bool> {
        self.cache
            .expire_if_eq(&Self::cache_key(&lease.key), lease.token.as_bytes(), lease.ttl)
            .await
    }

    async fn release(&self, lease: &Lease) -> CacheResult<()> {
        let released = self
            .cache
            .delete_if_eq(&Self::cache_key(&lease.key), lease.token.as_bytes())
            .await?;
        if !released {
            tracing::debug!(key = %lease.key, "Lease already expired or taken before release");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MemoryCache, config::MemoryCacheConfig};

    fn mutex() -> CacheClusterMutex {
        CacheClusterMutex::new(Arc::new(MemoryCache::new(&MemoryCacheConfig::default())))
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let mutex = mutex();
        let ttl = Duration::from_secs(60);

        let lease = mutex.try_acquire("job", ttl).await.unwrap().unwrap();
        assert!(mutex.try_acquire("job", ttl).await.unwrap().is_none());
        assert!(mutex.try_acquire("other-job", ttl).await.unwrap().is_some());

        mutex.release(&lease).await.unwrap();
        assert!(mutex.try_acquire("job", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_or_renew() {
        let mutex = mutex();

        let stale = mutex
            .try_acquire("job", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let current = mutex
            .try_acquire("job", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("expired lease can be taken over");

        assert!(!mutex.renew(&stale).await.unwrap());
        mutex.release(&stale).await.unwrap();

        // The new holder still owns the key
        assert!(mutex.try_acquire("job", Duration::from_secs(60)).await.unwrap().is_none());
        assert!(mutex.renew(&current).await.unwrap());
    }
}
