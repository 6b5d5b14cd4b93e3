use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Shared key/value store configuration.
///
/// The store holds:
/// - The cluster lease that makes a scheduled run exclusive across nodes
/// - Job metadata (when each scheduled job last finished)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CacheConfig {
    /// In-memory store. Good for single-node deployments.
    /// Leases only exclude runs within this process and job metadata is lost
    /// on restart.
    Memory(MemoryCacheConfig),

    /// Redis store. Required for multi-node deployments.
    Redis(RedisCacheConfig),
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory(MemoryCacheConfig::default())
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            CacheConfig::Memory(c) => c.validate(),
            CacheConfig::Redis(c) => c.validate(),
        }
    }
}

/// In-memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries in the store.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Number of entries to evict when the store is full.
    /// Eviction removes expired entries first, then the oldest.
    #[serde(default = "default_eviction_batch_size")]
    pub eviction_batch_size: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            eviction_batch_size: default_eviction_batch_size(),
        }
    }
}

impl MemoryCacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Validation(
                "Memory cache max_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_entries() -> usize {
    10_000
}

fn default_eviction_batch_size() -> usize {
    100
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisCacheConfig {
    /// Redis connection URL.
    /// Format: redis://[user:password@]host:port[/database]
    /// For clusters: redis+cluster://host1:port1,host2:port2,...
    pub url: String,

    /// Connection timeout in seconds.
    #[serde(default = "default_redis_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all keys.
    /// Useful when sharing a Redis instance with other applications.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Cluster mode configuration.
    #[serde(default)]
    pub cluster: Option<RedisClusterConfig>,
}

impl RedisCacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Validation("Redis URL cannot be empty".into()));
        }
        Ok(())
    }
}

/// Redis cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisClusterConfig {
    /// Read from replicas for read operations.
    #[serde(default)]
    pub read_from_replicas: bool,

    /// Number of retries for cluster operations.
    #[serde(default = "default_cluster_retries")]
    pub retries: u32,

    /// Connection timeout for cluster nodes in seconds.
    #[serde(default = "default_cluster_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Response timeout for cluster operations in seconds.
    #[serde(default = "default_cluster_response_timeout")]
    pub response_timeout_secs: u64,
}

fn default_redis_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "sweeper:".to_string()
}

fn default_cluster_retries() -> u32 {
    3
}

fn default_cluster_connection_timeout() -> u64 {
    5
}

fn default_cluster_response_timeout() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_memory() {
        assert!(matches!(CacheConfig::default(), CacheConfig::Memory(_)));
    }

    #[test]
    fn test_parse_redis() {
        let config: CacheConfig = toml::from_str(
            r#"
            type = "redis"
            url = "redis://localhost:6379"
        "#,
        )
        .unwrap();
        match config {
            CacheConfig::Redis(c) => {
                assert_eq!(c.key_prefix, "sweeper:");
                assert!(c.cluster.is_none());
            }
            other => panic!("expected redis, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_redis_url_rejected() {
        let config = CacheConfig::Redis(RedisCacheConfig {
            url: String::new(),
            connect_timeout_secs: 5,
            key_prefix: default_key_prefix(),
            cluster: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_entries_rejected() {
        let config = CacheConfig::Memory(MemoryCacheConfig {
            max_entries: 0,
            eviction_batch_size: 1,
        });
        assert!(config.validate().is_err());
    }
}
