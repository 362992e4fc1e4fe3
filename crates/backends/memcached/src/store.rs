use std::time::Duration;

use async_trait::async_trait;
use memcache::{Client, CommandError, MemcacheError};

use procstore_core::backend::KvBackend;
use procstore_core::error::StoreError;
use procstore_core::keys::render_binary;
use procstore_core::model::StoreId;

use crate::config::MemcachedConfig;

fn map_memcache_err(e: &MemcacheError) -> StoreError {
    match e {
        MemcacheError::IOError(_) | MemcacheError::PoolError(_) | MemcacheError::BadURL(_) => {
            StoreError::Connection(e.to_string())
        }
        _ => StoreError::Data(e.to_string()),
    }
}

/// True when `add` was rejected because a value is already stored.
fn add_rejected(e: &MemcacheError) -> bool {
    matches!(
        e,
        MemcacheError::CommandError(CommandError::KeyExists)
    )
}

/// Expiration argument for memcached commands. Values past 30 days are
/// interpreted by the server as unix timestamps, so large TTLs are capped
/// rather than passed through.
fn expiration(ttl: Duration) -> u32 {
    const THIRTY_DAYS: u64 = 60 * 60 * 24 * 30;
    u32::try_from(ttl.as_secs().clamp(1, THIRTY_DAYS)).unwrap_or(u32::MAX)
}

/// Read a decimal counter, treating absence as zero.
fn read_counter(client: &Client, key: &str) -> Result<u64, StoreError> {
    match client.get::<String>(key).map_err(|e| map_memcache_err(&e))? {
        Some(raw) => raw
            .parse()
            .map_err(|e| StoreError::Data(format!("corrupt counter {key:?}: {e}"))),
        None => Ok(0),
    }
}

/// Increment a decimal counter, creating it first if needed.
fn bump_counter(client: &Client, key: &str) -> Result<u64, StoreError> {
    if let Err(e) = client.add(key, "0", 0) {
        if !add_rejected(&e) {
            return Err(map_memcache_err(&e));
        }
    }
    client.increment(key, 1).map_err(|e| map_memcache_err(&e))
}

/// Decrement a counter if it exists. Memcached floors `decr` at zero.
fn drop_counter(client: &Client, key: &str) -> Result<(), StoreError> {
    match client.decrement(key, 1) {
        Ok(_) => Ok(()),
        Err(MemcacheError::CommandError(CommandError::KeyNotFound)) => Ok(()),
        Err(e) => Err(map_memcache_err(&e)),
    }
}

/// Memcached implementation of [`KvBackend`].
///
/// Entry keys embed the store's generation number; see the crate docs for
/// how that substitutes for enumeration. Raw keys are base64-rendered
/// because memcached keys must be short printable ASCII.
pub struct MemcachedBackend {
    client: Client,
    prefix: String,
}

impl MemcachedBackend {
    /// Connect to the configured servers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if no server is reachable.
    pub fn new(config: &MemcachedConfig) -> Result<Self, StoreError> {
        let client = Client::connect(config.servers.clone())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        client
            .set_read_timeout(Some(config.io_timeout))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        client
            .set_write_timeout(Some(config.io_timeout))
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::debug!(servers = config.servers.len(), "memcached client ready");
        Ok(Self {
            client,
            prefix: config.prefix.clone(),
        })
    }

    fn gen_key(&self, store: StoreId) -> String {
        format!("{}.g.{store}", self.prefix)
    }

    fn size_key(&self, store: StoreId, generation: u64) -> String {
        format!("{}.n.{store}.{generation}", self.prefix)
    }

    fn entry_key(&self, store: StoreId, generation: u64, key: &[u8]) -> String {
        format!("{}.s.{store}.{generation}.{}", self.prefix, render_binary(key))
    }

    fn ttl_ns_key(&self, key: &[u8]) -> String {
        format!("{}.t.{}", self.prefix, render_binary(key))
    }

    fn meta_ns_key(&self, key: &str) -> String {
        format!("{}.m.{key}", self.prefix)
    }

    /// Run a synchronous client operation off the async runtime.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T, StoreError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || op(&client))
            .await
            .map_err(|e| StoreError::Connection(format!("memcached worker failed: {e}")))?
    }
}

#[async_trait]
impl KvBackend for MemcachedBackend {
    fn product_name(&self) -> &'static str {
        "memcached"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let gen_key = self.gen_key(store);
        let prefix = self.prefix.clone();
        let key = key.to_vec();
        let value = value.to_vec();
        let store_id = store;
        self.blocking(move |client| {
            let generation = read_counter(client, &gen_key)?;
            let entry = format!("{prefix}.s.{store_id}.{generation}.{}", render_binary(&key));
            match client.add(&entry, value.as_slice(), 0) {
                Ok(()) => {
                    bump_counter(client, &format!("{prefix}.n.{store_id}.{generation}"))?;
                    Ok(true)
                }
                Err(e) if add_rejected(&e) => {
                    client
                        .set(&entry, value.as_slice(), 0)
                        .map_err(|e| map_memcache_err(&e))?;
                    Ok(false)
                }
                Err(e) => Err(map_memcache_err(&e)),
            }
        })
        .await
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let gen_key = self.gen_key(store);
        let prefix = self.prefix.clone();
        let key = key.to_vec();
        let store_id = store;
        self.blocking(move |client| {
            let generation = read_counter(client, &gen_key)?;
            let entry = format!("{prefix}.s.{store_id}.{generation}.{}", render_binary(&key));
            client
                .get::<Vec<u8>>(&entry)
                .map_err(|e| map_memcache_err(&e))
        })
        .await
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let gen_key = self.gen_key(store);
        let prefix = self.prefix.clone();
        let key = key.to_vec();
        let store_id = store;
        self.blocking(move |client| {
            let generation = read_counter(client, &gen_key)?;
            let entry = format!("{prefix}.s.{store_id}.{generation}.{}", render_binary(&key));
            let removed = client.delete(&entry).map_err(|e| map_memcache_err(&e))?;
            if removed {
                drop_counter(client, &format!("{prefix}.n.{store_id}.{generation}"))?;
            }
            Ok(removed)
        })
        .await
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(store, key).await?.is_some())
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        let gen_key = self.gen_key(store);
        self.blocking(move |client| {
            // Orphans every entry of the previous generation; the server
            // evicts them under memory pressure.
            bump_counter(client, &gen_key)?;
            Ok(())
        })
        .await
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        let gen_key = self.gen_key(store);
        let prefix = self.prefix.clone();
        let store_id = store;
        self.blocking(move |client| {
            let generation = read_counter(client, &gen_key)?;
            read_counter(client, &format!("{prefix}.n.{store_id}.{generation}"))
        })
        .await
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let entry = self.ttl_ns_key(key);
        let value = value.to_vec();
        self.blocking(move |client| {
            client
                .set(&entry, value.as_slice(), expiration(ttl))
                .map_err(|e| map_memcache_err(&e))
        })
        .await
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let entry = self.ttl_ns_key(key);
        self.blocking(move |client| {
            client
                .get::<Vec<u8>>(&entry)
                .map_err(|e| map_memcache_err(&e))
        })
        .await
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let entry = self.ttl_ns_key(key);
        self.blocking(move |client| client.delete(&entry).map_err(|e| map_memcache_err(&e)))
            .await
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn meta_check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let entry = self.meta_ns_key(key);
        let value = value.to_owned();
        let exp = ttl.map_or(0, expiration);
        self.blocking(move |client| match client.add(&entry, value.as_str(), exp) {
            Ok(()) => Ok(true),
            Err(e) if add_rejected(&e) => Ok(false),
            Err(e) => Err(map_memcache_err(&e)),
        })
        .await
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entry = self.meta_ns_key(key);
        self.blocking(move |client| client.get::<String>(&entry).map_err(|e| map_memcache_err(&e)))
            .await
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let entry = self.meta_ns_key(key);
        let value = value.to_owned();
        let exp = ttl.map_or(0, expiration);
        self.blocking(move |client| {
            client
                .set(&entry, value.as_str(), exp)
                .map_err(|e| map_memcache_err(&e))
        })
        .await
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        let entry = self.meta_ns_key(key);
        self.blocking(move |client| client.delete(&entry).map_err(|e| map_memcache_err(&e)))
            .await
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let entry = self.meta_ns_key(key);
        let expected = expected.to_owned();
        // Read-compare-delete; memcached has no conditional delete, so a
        // writer landing between the two steps can be lost.
        self.blocking(move |client| {
            let current = client
                .get::<String>(&entry)
                .map_err(|e| map_memcache_err(&e))?;
            if current.as_deref() != Some(expected.as_str()) {
                return Ok(false);
            }
            client.delete(&entry).map_err(|e| map_memcache_err(&e))
        })
        .await
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        let entry = self.meta_ns_key(key);
        self.blocking(move |client| bump_counter(client, &entry))
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.blocking(move |client| {
            client
                .version()
                .map(|_| ())
                .map_err(|e| StoreError::Connection(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_caps_at_thirty_days() {
        assert_eq!(expiration(Duration::from_secs(0)), 1);
        assert_eq!(expiration(Duration::from_secs(3600)), 3600);
        assert_eq!(
            expiration(Duration::from_secs(90 * 24 * 60 * 60)),
            60 * 60 * 24 * 30
        );
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use procstore_core::testing::run_backend_conformance;

    fn test_config() -> MemcachedConfig {
        MemcachedConfig {
            servers: vec![std::env::var("MEMCACHED_URL")
                .unwrap_or_else(|_| "memcache://127.0.0.1:11211".to_string())],
            prefix: format!("pt{}", uuid::Uuid::new_v4().simple()),
            ..MemcachedConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let backend = MemcachedBackend::new(&test_config()).expect("server should be reachable");
        run_backend_conformance(&backend)
            .await
            .expect("conformance suite should pass");
    }
}
