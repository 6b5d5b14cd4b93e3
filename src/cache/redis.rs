use std::time::Duration;

use async_trait::async_trait;
use redis::{
    ConnectionInfo, IntoConnectionInfo, aio::MultiplexedConnection, cluster::ClusterClient,
    cluster_async::ClusterConnection,
};

use super::{
    error::{CacheError, CacheResult},
    traits::Cache,
};
use crate::config::RedisCacheConfig;

/// A wrapper enum for either a standalone or cluster Redis connection.
enum RedisConn {
    Standalone(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// Execute a Redis command on either connection type.
macro_rules! redis_cmd {
    ($conn:expr, $cmd:expr) => {
        match $conn {
            RedisConn::Standalone(ref mut c) => $cmd.query_async(c).await,
            RedisConn::Cluster(ref mut c) => $cmd.query_async(c).await,
        }
    };
}

/// Execute a Redis script on either connection type.
macro_rules! redis_script {
    ($conn:expr, $script:expr) => {
        match $conn {
            RedisConn::Standalone(ref mut c) => $script.invoke_async(c).await,
            RedisConn::Cluster(ref mut c) => $script.invoke_async(c).await,
        }
    };
}

/// Delete the key only if it still holds the caller's token.
/// Returns 1 if deleted, 0 otherwise.
const DELETE_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Reset the key's TTL only if it still holds the caller's token.
/// Returns 1 if the TTL was updated, 0 otherwise.
const EXPIRE_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    local ttl = tonumber(ARGV[2])
    if ttl > 0 then
        return redis.call('PEXPIRE', KEYS[1], ttl)
    end
    redis.call('PERSIST', KEYS[1])
    return 1
end
return 0
"#;

/// Internal enum to hold either a standalone or cluster Redis client.
enum RedisConnection {
    Standalone(redis::Client),
    Cluster(ClusterClient),
}

pub struct RedisCache {
    connection: RedisConnection,
    key_prefix: String,
}

impl RedisCache {
    pub async fn from_config(config: &RedisCacheConfig) -> CacheResult<Self> {
        let connection = if let Some(cluster_config) = &config.cluster {
            // Cluster mode: comma-separated node list, e.g.
            // "redis://host1:6379,host2:6379,host3:6379"
            let nodes: Vec<ConnectionInfo> = config
                .url
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| {
                    let node_url = if s.starts_with("redis://") || s.starts_with("rediss://") {
                        s.to_string()
                    } else {
                        format!("redis://{}", s)
                    };
                    node_url.into_connection_info()
                })
                .collect::<Result<Vec<_>, _>>()?;

            if nodes.is_empty() {
                return Err(CacheError::Redis(redis::RedisError::from((
                    redis::ErrorKind::InvalidClientConfig,
                    "No cluster nodes specified in URL",
                ))));
            }

            let mut builder = redis::cluster::ClusterClientBuilder::new(nodes);

            if cluster_config.read_from_replicas {
                builder = builder.read_from_replicas();
            }

            builder = builder.retries(cluster_config.retries);
            builder = builder
                .connection_timeout(Duration::from_secs(cluster_config.connection_timeout_secs));
            builder =
                builder.response_timeout(Duration::from_secs(cluster_config.response_timeout_secs));

            RedisConnection::Cluster(builder.build()?)
        } else {
            let client = redis::Client::open(config.url.as_str())?;
            RedisConnection::Standalone(client)
        };

        let cache = Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        };

        // Fail at startup rather than on the first scheduled tick
        let connect = cache.get_connection();
        tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), connect)
            .await
            .map_err(|_| {
                CacheError::Internal(format!(
                    "timed out connecting to Redis after {}s",
                    config.connect_timeout_secs
                ))
            })??;

        Ok(cache)
    }

    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Get a Redis connection, either standalone or cluster.
    async fn get_connection(&self) -> CacheResult<RedisConn> {
        match &self.connection {
            RedisConnection::Standalone(client) => {
                let conn = client.get_multiplexed_async_connection().await?;
                Ok(RedisConn::Standalone(conn))
            }
            RedisConnection::Cluster(client) => {
                let conn = client.get_async_connection().await?;
                Ok(RedisConn::Cluster(conn))
            }
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        let full_key = self.prefixed_key(key);

        let data: Option<Vec<u8>> = redis_cmd!(conn, redis::cmd("GET").arg(&full_key))?;

        Ok(data)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let full_key = self.prefixed_key(key);

        if !ttl.is_zero() {
            let _: () = redis_cmd!(
                conn,
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
            )?;
        } else {
            let _: () = redis_cmd!(conn, redis::cmd("SET").arg(&full_key).arg(value))?;
        }

        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let full_key = self.prefixed_key(key);

        let result: Option<String> = if !ttl.is_zero() {
            redis_cmd!(
                conn,
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
            )?
        } else {
            redis_cmd!(conn, redis::cmd("SET").arg(&full_key).arg(value).arg("NX"))?
        };

        // SET ... NX returns "OK" if set, nil if key exists
        Ok(result.is_some())
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let full_key = self.prefixed_key(key);

        let deleted: i64 = redis_script!(
            conn,
            redis::Script::new(DELETE_IF_EQ_SCRIPT)
                .key(&full_key)
                .arg(expected)
        )?;
        Ok(deleted == 1)
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let full_key = self.prefixed_key(key);

        let updated: i64 = redis_script!(
            conn,
            redis::Script::new(EXPIRE_IF_EQ_SCRIPT)
                .key(&full_key)
                .arg(expected)
                .arg(ttl.as_millis() as u64)
        )?;
        Ok(updated == 1)
    }
}
