mod error;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod traits;

use std::sync::Arc;

pub use error::{CacheError, CacheResult};
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis::RedisCache;
pub use traits::Cache;

use crate::config::CacheConfig;

/// Build the configured store.
pub async fn create_cache(config: &CacheConfig) -> CacheResult<Arc<dyn Cache>> {
    match config {
        CacheConfig::Memory(cfg) => Ok(Arc::new(MemoryCache::new(cfg))),
        CacheConfig::Redis(cfg) => {
            #[cfg(feature = "redis")]
            {
                Ok(Arc::new(RedisCache::from_config(cfg).await?))
            }
            #[cfg(not(feature = "redis"))]
            {
                let _ = cfg;
                Err(CacheError::Internal(
                    "Redis cache configured but 'redis' feature not enabled. \
                     Rebuild with: cargo build --features redis"
                        .into(),
                ))
            }
        }
    }
}
