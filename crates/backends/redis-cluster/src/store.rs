use std::time::Duration;

use async_trait::async_trait;
use redis::FromRedisValue;

use procstore_core::backend::KvBackend;
use procstore_core::error::StoreError;
use procstore_core::model::StoreId;
use procstore_redis::scripts;

use crate::config::RedisClusterConfig;
use crate::conn::ConnLink;
use crate::router::Router;

fn value_to<T: FromRedisValue>(value: &redis::Value) -> Result<T, StoreError> {
    redis::from_redis_value(value)
        .map_err(|e| StoreError::Data(format!("unexpected reply shape: {e}")))
}

/// Redis Cluster implementation of [`KvBackend`].
///
/// Same key scheme as the standalone Redis adapter (one hash per store,
/// plain keys for the TTL and meta namespaces), with every command routed
/// through the slot-aware [`Router`]. A store's hash lives wholly in one
/// slot, so `clear` and `size` stay single commands.
///
/// Cluster mode does not support `EVALSHA` script caching across nodes
/// uniformly, so the meta primitives send the script text with `EVAL`
/// each time. The scripts are a few dozen bytes.
pub struct RedisClusterBackend {
    router: Router<ConnLink>,
    prefix: String,
}

impl RedisClusterBackend {
    /// Dial the cluster and fetch the initial slot map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if no seed node yields a slot
    /// map within the configured timeout.
    pub async fn connect(config: &RedisClusterConfig) -> Result<Self, StoreError> {
        let router = Router::new(ConnLink::new(config), config.seeds.clone());
        router.refresh().await?;
        Ok(Self {
            router,
            prefix: config.prefix.clone(),
        })
    }

    fn store_key(&self, store: StoreId) -> String {
        format!("{}:s:{store}", self.prefix)
    }

    fn ttl_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = format!("{}:ttl:", self.prefix).into_bytes();
        k.extend_from_slice(key);
        k
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}:meta:{key}", self.prefix)
    }

    /// Run a script against the node owning `key`'s slot.
    async fn eval(
        &self,
        script: &str,
        key: &str,
        args: &[&str],
    ) -> Result<redis::Value, StoreError> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(1).arg(key);
        for a in args {
            cmd.arg(*a);
        }
        self.router.run(key.as_bytes(), &cmd).await
    }
}

#[async_trait]
impl KvBackend for RedisClusterBackend {
    fn product_name(&self) -> &'static str {
        "redis-cluster"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let hash = self.store_key(store);
        let reply = self
            .router
            .run(
                hash.as_bytes(),
                redis::cmd("HSET").arg(&hash).arg(key).arg(value),
            )
            .await?;
        Ok(value_to::<i64>(&reply)? == 1)
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let hash = self.store_key(store);
        let reply = self
            .router
            .run(hash.as_bytes(), redis::cmd("HGET").arg(&hash).arg(key))
            .await?;
        value_to(&reply)
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let hash = self.store_key(store);
        let reply = self
            .router
            .run(hash.as_bytes(), redis::cmd("HDEL").arg(&hash).arg(key))
            .await?;
        Ok(value_to::<i64>(&reply)? > 0)
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let hash = self.store_key(store);
        let reply = self
            .router
            .run(hash.as_bytes(), redis::cmd("HEXISTS").arg(&hash).arg(key))
            .await?;
        value_to(&reply)
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        let hash = self.store_key(store);
        self.router
            .run(hash.as_bytes(), redis::cmd("DEL").arg(&hash))
            .await?;
        Ok(())
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        let hash = self.store_key(store);
        let reply = self
            .router
            .run(hash.as_bytes(), redis::cmd("HLEN").arg(&hash))
            .await?;
        value_to(&reply)
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let k = self.ttl_key(key);
        self.router
            .run(
                &k,
                redis::cmd("SET")
                    .arg(&k)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1)),
            )
            .await?;
        Ok(())
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let k = self.ttl_key(key);
        let reply = self.router.run(&k, redis::cmd("GET").arg(&k)).await?;
        value_to(&reply)
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let k = self.ttl_key(key);
        let reply = self.router.run(&k, redis::cmd("DEL").arg(&k)).await?;
        Ok(value_to::<i64>(&reply)? > 0)
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let k = self.ttl_key(key);
        let reply = self.router.run(&k, redis::cmd("EXISTS").arg(&k)).await?;
        value_to(&reply)
    }

    async fn meta_check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let ttl_ms = ttl
            .map_or(0i64, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .to_string();
        let reply = self
            .eval(
                scripts::CHECK_AND_SET,
                &self.meta_key(key),
                &[value, &ttl_ms],
            )
            .await?;
        Ok(value_to::<i64>(&reply)? == 1)
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let k = self.meta_key(key);
        let reply = self
            .router
            .run(k.as_bytes(), redis::cmd("GET").arg(&k))
            .await?;
        value_to(&reply)
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let k = self.meta_key(key);
        let mut cmd = redis::cmd("SET");
        cmd.arg(&k).arg(value);
        if let Some(d) = ttl {
            cmd.arg("EX").arg(d.as_secs().max(1));
        }
        self.router.run(k.as_bytes(), &cmd).await?;
        Ok(())
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        let k = self.meta_key(key);
        let reply = self
            .router
            .run(k.as_bytes(), redis::cmd("DEL").arg(&k))
            .await?;
        Ok(value_to::<i64>(&reply)? > 0)
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let reply = self
            .eval(
                scripts::COMPARE_AND_DELETE,
                &self.meta_key(key),
                &[expected],
            )
            .await?;
        Ok(value_to::<i64>(&reply)? == 1)
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        let k = self.meta_key(key);
        let reply = self
            .router
            .run(k.as_bytes(), redis::cmd("INCR").arg(&k))
            .await?;
        let value: i64 = value_to(&reply)?;
        u64::try_from(value)
            .map_err(|_| StoreError::Data(format!("counter {key:?} went negative")))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        // Routed like any key so it lands on a live primary.
        self.router
            .run(b"ping", &redis::cmd("PING"))
            .await
            .map(|_| ())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use procstore_core::testing::run_backend_conformance;

    fn test_config() -> RedisClusterConfig {
        let seeds = std::env::var("REDIS_CLUSTER_SEEDS")
            .unwrap_or_else(|_| "127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002".to_string());
        RedisClusterConfig {
            seeds: seeds.split(',').map(str::to_owned).collect(),
            prefix: format!("procstore-test-{}", uuid::Uuid::new_v4()),
            ..RedisClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let backend = RedisClusterBackend::connect(&test_config())
            .await
            .expect("cluster should be reachable");
        run_backend_conformance(&backend)
            .await
            .expect("conformance suite should pass");
    }
}
