//! Store facade: the application-facing surface over one backend adapter.
//!
//! Every call funnels through the retrier, so transient connection faults
//! are absorbed up to the policy budget before the caller sees them.

use std::sync::Arc;
use std::time::Duration;

use procstore_core::{KvBackend, StoreError, StoreId, StoreMeta};

use crate::retry::{Retrier, RetryPolicy};

/// Shared key/value store operations over a configured backend.
pub struct StoreEngine {
    backend: Arc<dyn KvBackend>,
    retrier: Retrier,
}

impl StoreEngine {
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            retrier: Retrier::new(policy),
        }
    }

    /// Name of the backing store product.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.product_name()
    }

    /// Whether the backend currently answers a health probe.
    pub async fn is_connected(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    // ------------------------------------------------------------------
    // Store lifecycle
    // ------------------------------------------------------------------

    /// Create a store or fetch it if it already exists. Race-safe across
    /// processes sharing the backend.
    pub async fn create_or_get_store(
        &self,
        name: &str,
        key_type: &str,
        value_type: &str,
    ) -> Result<StoreId, StoreError> {
        self.retrier
            .run(&*self.backend, "create_or_get_store", || {
                self.backend.create_or_get_store(name, key_type, value_type)
            })
            .await
    }

    /// Look up a store by name.
    pub async fn find_store(&self, name: &str) -> Result<Option<StoreId>, StoreError> {
        self.retrier
            .run(&*self.backend, "find_store", || {
                self.backend.find_store(name)
            })
            .await
    }

    /// Remove a store and everything in it. Returns `true` if it existed.
    pub async fn remove_store(&self, store: StoreId) -> Result<bool, StoreError> {
        self.retrier
            .run(&*self.backend, "remove_store", || {
                self.backend.remove_store(store)
            })
            .await
    }

    /// Fetch a store's metadata record.
    pub async fn store_meta(&self, store: StoreId) -> Result<StoreMeta, StoreError> {
        self.retrier
            .run(&*self.backend, "store_meta", || {
                self.backend.store_meta(store)
            })
            .await
    }

    /// The name a store was created under.
    pub async fn store_name(&self, store: StoreId) -> Result<String, StoreError> {
        Ok(self.store_meta(store).await?.name)
    }

    /// The key type hint recorded at creation.
    pub async fn key_type(&self, store: StoreId) -> Result<String, StoreError> {
        Ok(self.store_meta(store).await?.key_type)
    }

    /// The value type hint recorded at creation.
    pub async fn value_type(&self, store: StoreId) -> Result<String, StoreError> {
        Ok(self.store_meta(store).await?.value_type)
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    /// Store a key/value pair. Returns `true` if the key was newly created.
    pub async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        self.retrier
            .run(&*self.backend, "put", || self.backend.put(store, key, value))
            .await
    }

    /// Fetch a value.
    ///
    /// # Errors
    ///
    /// [`StoreError::KeyNotFound`] when the key is absent; use [`lookup`]
    /// for an `Option`-shaped read.
    ///
    /// [`lookup`]: StoreEngine::lookup
    pub async fn get(&self, store: StoreId, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.lookup(store, key)
            .await?
            .ok_or_else(|| StoreError::KeyNotFound(String::from_utf8_lossy(key).into_owned()))
    }

    /// Fetch a value, `None` when absent.
    pub async fn lookup(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.retrier
            .run(&*self.backend, "get", || self.backend.get(store, key))
            .await
    }

    /// Remove a key. Returns `true` if it was present.
    pub async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        self.retrier
            .run(&*self.backend, "remove", || self.backend.remove(store, key))
            .await
    }

    /// Existence probe.
    pub async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        self.retrier
            .run(&*self.backend, "has", || self.backend.has(store, key))
            .await
    }

    /// Remove every entry, keeping the store itself.
    pub async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        self.retrier
            .run(&*self.backend, "clear", || self.backend.clear(store))
            .await
    }

    /// Number of entries currently in the store.
    pub async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        self.retrier
            .run(&*self.backend, "size", || self.backend.size(store))
            .await
    }

    // ------------------------------------------------------------------
    // TTL namespace
    // ------------------------------------------------------------------

    /// Store a key/value pair in the global TTL namespace.
    pub async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.retrier
            .run(&*self.backend, "put_ttl", || {
                self.backend.put_ttl(key, value, ttl)
            })
            .await
    }

    /// Fetch from the TTL namespace.
    ///
    /// # Errors
    ///
    /// [`StoreError::KeyNotFound`] when the key is absent or expired.
    pub async fn get_ttl(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.retrier
            .run(&*self.backend, "get_ttl", || self.backend.get_ttl(key))
            .await?
            .ok_or_else(|| StoreError::KeyNotFound(String::from_utf8_lossy(key).into_owned()))
    }

    /// Remove from the TTL namespace. Returns `true` if a live entry existed.
    pub async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.retrier
            .run(&*self.backend, "remove_ttl", || self.backend.remove_ttl(key))
            .await
    }

    /// Existence probe on the TTL namespace.
    pub async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.retrier
            .run(&*self.backend, "has_ttl", || self.backend.has_ttl(key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use procstore_memory::MemoryBackend;

    fn engine() -> StoreEngine {
        StoreEngine::new(Arc::new(MemoryBackend::new()), RetryPolicy::default())
    }

    #[tokio::test]
    async fn entry_round_trip() {
        let engine = engine();
        let id = engine
            .create_or_get_store("orders", "rstring", "blob")
            .await
            .unwrap();

        assert!(engine.put(id, b"k1", b"v1").await.unwrap());
        assert_eq!(engine.get(id, b"k1").await.unwrap(), b"v1");
        assert!(engine.has(id, b"k1").await.unwrap());
        assert_eq!(engine.size(id).await.unwrap(), 1);

        assert!(engine.remove(id, b"k1").await.unwrap());
        assert!(matches!(
            engine.get(id, b"k1").await,
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_key_reads_are_key_not_found() {
        let engine = engine();
        let id = engine
            .create_or_get_store("s", "rstring", "rstring")
            .await
            .unwrap();

        assert!(matches!(
            engine.get(id, b"nope").await,
            Err(StoreError::KeyNotFound(_))
        ));
        assert!(engine.lookup(id, b"nope").await.unwrap().is_none());
        assert!(!engine.remove(id, b"nope").await.unwrap());
    }

    #[tokio::test]
    async fn store_lifecycle_round_trip() {
        let engine = engine();
        let id = engine
            .create_or_get_store("cache", "rstring", "int64")
            .await
            .unwrap();

        assert_eq!(engine.find_store("cache").await.unwrap(), Some(id));
        assert_eq!(engine.store_name(id).await.unwrap(), "cache");
        assert_eq!(engine.key_type(id).await.unwrap(), "rstring");
        assert_eq!(engine.value_type(id).await.unwrap(), "int64");

        assert!(engine.remove_store(id).await.unwrap());
        assert_eq!(engine.find_store("cache").await.unwrap(), None);
        assert!(!engine.remove_store(id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_namespace_round_trip() {
        let engine = engine();
        engine
            .put_ttl(b"session", b"alive", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(engine.get_ttl(b"session").await.unwrap(), b"alive");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            engine.get_ttl(b"session").await,
            Err(StoreError::KeyNotFound(_))
        ));
        assert!(!engine.has_ttl(b"session").await.unwrap());
    }

    #[tokio::test]
    async fn health_probe_reports_connected() {
        let engine = engine();
        assert!(engine.is_connected().await);
        assert_eq!(engine.backend_name(), "memory");
    }
}
