use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use procstore_core::backend::KvBackend;
use procstore_core::error::StoreError;
use procstore_core::model::StoreId;

/// A meta or TTL entry with an optional deadline.
#[derive(Debug, Clone)]
struct Timed {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Timed {
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

fn expiry_from_ttl(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

/// In-memory [`KvBackend`] backed by [`DashMap`]s.
///
/// Store entries never expire; the TTL namespace and meta entries are
/// lazily evicted on read once their deadline passes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<(u64, Vec<u8>), Vec<u8>>,
    ttl_entries: DashMap<Vec<u8>, Timed>,
    meta: DashMap<String, Timed>,
}

impl MemoryBackend {
    /// Create a new, empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn product_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let prior = self
            .entries
            .insert((store.value(), key.to_vec()), value.to_vec());
        Ok(prior.is_none())
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .get(&(store.value(), key.to_vec()))
            .map(|e| e.clone()))
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.entries.remove(&(store.value(), key.to_vec())).is_some())
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(&(store.value(), key.to_vec())))
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        self.entries.retain(|(sid, _), _| *sid != store.value());
        Ok(())
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        let count = self
            .entries
            .iter()
            .filter(|e| e.key().0 == store.value())
            .count();
        Ok(count as u64)
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.ttl_entries.insert(
            key.to_vec(),
            Timed {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(entry) = self.ttl_entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.ttl_entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        match self.ttl_entries.remove(key) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
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
        // Evict an expired entry first so it reads as vacant.
        self.meta.remove_if(key, |_, entry| entry.is_expired());

        let was_inserted = match self.meta.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Timed {
                    value: value.as_bytes().to_vec(),
                    expires_at: expiry_from_ttl(ttl),
                });
                true
            }
        };
        Ok(was_inserted)
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.meta.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.meta.remove(key);
                return Ok(None);
            }
            let text = String::from_utf8(entry.value.clone())
                .map_err(|e| StoreError::Data(format!("non-UTF8 meta entry {key:?}: {e}")))?;
            return Ok(Some(text));
        }
        Ok(None)
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.meta.insert(
            key.to_owned(),
            Timed {
                value: value.as_bytes().to_vec(),
                expires_at: expiry_from_ttl(ttl),
            },
        );
        Ok(())
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        match self.meta.remove(key) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let removed = self
            .meta
            .remove_if(key, |_, entry| {
                !entry.is_expired() && entry.value == expected.as_bytes()
            })
            .is_some();
        Ok(removed)
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        self.meta.remove_if(key, |_, entry| entry.is_expired());

        let mut entry = self.meta.entry(key.to_owned()).or_insert_with(|| Timed {
            value: b"0".to_vec(),
            expires_at: None,
        });

        let current: u64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::Data(format!("counter {key:?} is not an integer")))?;
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use procstore_core::testing::run_backend_conformance;

    use super::*;

    #[tokio::test]
    async fn conformance() {
        let backend = MemoryBackend::new();
        run_backend_conformance(&backend)
            .await
            .expect("conformance suite should pass");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_entry_expires_on_read() {
        let backend = MemoryBackend::new();
        backend
            .put_ttl(b"k", b"v", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(backend.get_ttl(b"k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(backend.get_ttl(b"k").await.unwrap(), None);
        assert!(!backend.has_ttl(b"k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn check_and_set_reclaims_expired_meta() {
        let backend = MemoryBackend::new();

        let set = backend
            .meta_check_and_set("m", "v1", Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert!(set);
        assert!(!backend.meta_check_and_set("m", "v2", None).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(
            backend.meta_check_and_set("m", "v2", None).await.unwrap(),
            "expired entry should read as vacant"
        );
        assert_eq!(backend.meta_get("m").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn concurrent_store_creation_converges() {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                backend
                    .create_or_get_store("racy", "rstring", "rstring")
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().expect("creation should succeed"));
        }
        let first = ids[0];
        assert!(
            ids.iter().all(|id| *id == first),
            "all racers should converge on one store id"
        );
    }

    #[tokio::test]
    async fn values_are_opaque_bytes() {
        let backend = MemoryBackend::new();
        let id = backend
            .create_or_get_store("bin", "blob", "blob")
            .await
            .unwrap();

        let value = vec![0u8, 255, 128, 10, 13];
        backend.put(id, b"\x00key", &value).await.unwrap();
        assert_eq!(backend.get(id, b"\x00key").await.unwrap(), Some(value));
    }
}
