use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use super::{error::CacheResult, traits::Cache};
use crate::config::MemoryCacheConfig;

struct CacheEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    last_accessed: Instant,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: expiry(ttl),
            last_accessed: Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

/// In-memory store using DashMap for concurrent access.
///
/// # Multi-Node Deployments
///
/// **WARNING**: This store is NOT suitable for multi-node deployments.
///
/// Each node keeps its own leases, so two nodes sharing a record database
/// would both run every tick. Clone the [`Arc`] to share one store between
/// schedulers in the same process.
///
/// See [`CacheConfig::Redis`](crate::config::CacheConfig::Redis) in the configuration.
pub struct MemoryCache {
    data: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
    eviction_batch_size: usize,
}

impl MemoryCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            max_entries: config.max_entries,
            eviction_batch_size: config.eviction_batch_size.max(1),
        }
    }

    fn evict_if_needed(&self) {
        if self.data.len() < self.max_entries {
            return;
        }

        // First pass: remove all expired entries
        self.data.retain(|_, entry| !entry.is_expired());

        let current_len = self.data.len();
        if current_len < self.max_entries {
            return;
        }

        let target_size = self.max_entries.saturating_sub(self.eviction_batch_size);
        let to_evict = current_len.saturating_sub(target_size);

        if to_evict == 0 {
            return;
        }

        // Oldest first
        let mut entries: Vec<_> = self
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_accessed))
            .collect();
        entries.sort_by_key(|(_, last_accessed)| *last_accessed);

        for (key, _) in entries.into_iter().take(to_evict) {
            self.data.remove(&key);
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(mut entry) = self.data.get_mut(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove_if(key, |_, e| e.is_expired());
                return Ok(None);
            }

            entry.touch();
            Ok(Some(entry.data.clone()))
        } else {
            Ok(None)
        }
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.evict_if_needed();

        self.data
            .insert(key.to_string(), CacheEntry::new(value.to_vec(), ttl));

        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.evict_if_needed();

        // Entry API keeps the check and the insert under one shard lock
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(CacheEntry::new(value.to_vec(), ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(e) => {
                e.insert(CacheEntry::new(value.to_vec(), ttl));
                Ok(true)
            }
        }
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let removed = self
            .data
            .remove_if(key, |_, entry| !entry.is_expired() && entry.data == expected);
        Ok(removed.is_some())
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> CacheResult<bool> {
        match self.data.get_mut(key) {
            Some(mut entry) if !entry.is_expired() && entry.data == expected => {
                entry.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
