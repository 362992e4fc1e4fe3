use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};

use procstore_core::backend::KvBackend;
use procstore_core::error::StoreError;
use procstore_core::model::StoreId;

use crate::config::RedisBackendConfig;
use crate::scripts;

/// Translate a redis-rs error into the normalized taxonomy.
pub fn map_redis_err(e: &redis::RedisError) -> StoreError {
    if e.kind() == redis::ErrorKind::AuthenticationFailed {
        StoreError::Auth(e.to_string())
    } else if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
    {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Data(e.to_string())
    }
}

/// Redis-backed implementation of [`KvBackend`].
///
/// One hash per store id holds that store's entries; field names are the
/// raw key bytes (Redis hash fields are binary-safe).
pub struct RedisBackend {
    pool: Pool,
    prefix: String,
}

impl RedisBackend {
    /// Create a new `RedisBackend` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisBackendConfig) -> Result<Self, StoreError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::debug!(pool_size = config.pool_size, "redis pool ready");
        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
        })
    }

    /// Redis key of the hash holding a store's entries.
    fn store_key(&self, store: StoreId) -> String {
        format!("{}:s:{store}", self.prefix)
    }

    /// Redis key of a TTL-namespace entry. Built as raw bytes because
    /// caller keys are opaque binary.
    fn ttl_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = format!("{}:ttl:", self.prefix).into_bytes();
        k.extend_from_slice(key);
        k
    }

    /// Redis key of a meta entry.
    fn meta_key(&self, key: &str) -> String {
        format!("{}:meta:{key}", self.prefix)
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn product_name(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let added: i64 = conn
            .hset(self.store_key(store), key, value)
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(added == 1)
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        conn.hget(self.store_key(store), key)
            .await
            .map_err(|e| map_redis_err(&e))
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .hdel(self.store_key(store), key)
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(removed > 0)
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        conn.hexists(self.store_key(store), key)
            .await
            .map_err(|e| map_redis_err(&e))
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .del(self.store_key(store))
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(())
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        conn.hlen(self.store_key(store))
            .await
            .map_err(|e| map_redis_err(&e))
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let secs = ttl.as_secs().max(1);
        let () = conn
            .set_ex(self.ttl_key(key), value, secs)
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(())
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(self.ttl_key(key))
            .await
            .map_err(|e| map_redis_err(&e))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .del(self.ttl_key(key))
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(removed > 0)
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        conn.exists(self.ttl_key(key))
            .await
            .map_err(|e| map_redis_err(&e))
    }

    async fn meta_check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let ttl_ms = ttl.map_or(0i64, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        let mut conn = self.conn().await?;

        let script = Script::new(scripts::CHECK_AND_SET);
        let result: i64 = script
            .key(self.meta_key(key))
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(result == 1)
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(self.meta_key(key))
            .await
            .map_err(|e| map_redis_err(&e))
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(d) => {
                let () = conn
                    .set_ex(self.meta_key(key), value, d.as_secs().max(1))
                    .await
                    .map_err(|e| map_redis_err(&e))?;
            }
            None => {
                let () = conn
                    .set(self.meta_key(key), value)
                    .await
                    .map_err(|e| map_redis_err(&e))?;
            }
        }
        Ok(())
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .del(self.meta_key(key))
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(removed > 0)
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let script = Script::new(scripts::COMPARE_AND_DELETE);
        let result: i64 = script
            .key(self.meta_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(result == 1)
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let value: i64 = conn
            .incr(self.meta_key(key), 1)
            .await
            .map_err(|e| map_redis_err(&e))?;
        u64::try_from(value)
            .map_err(|_| StoreError::Data(format!("counter {key:?} went negative")))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| map_redis_err(&e))?;
        Ok(())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use procstore_core::testing::run_backend_conformance;

    fn test_config() -> RedisBackendConfig {
        RedisBackendConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            prefix: format!("procstore-test-{}", uuid::Uuid::new_v4()),
            ..RedisBackendConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let backend = RedisBackend::new(&test_config()).expect("pool creation should succeed");
        run_backend_conformance(&backend)
            .await
            .expect("conformance suite should pass");
    }
}
