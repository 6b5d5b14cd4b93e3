use std::time::Duration;

use async_trait::async_trait;

use super::error::CacheResult;

/// Shared key/value store used for cluster leases and job metadata.
///
/// A zero `ttl` stores the value without expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get raw bytes from cache
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set raw bytes in cache with TTL
    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Set raw bytes only if key doesn't exist (atomic set-if-not-exists).
    /// Returns true if the value was set, false if key already exists.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Atomically delete `key` only if it currently holds `expected`.
    /// Returns true if the key was deleted.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool>;

    /// Atomically reset the TTL of `key` only if it currently holds `expected`.
    /// Returns true if the TTL was updated.
    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> CacheResult<bool>;
}
