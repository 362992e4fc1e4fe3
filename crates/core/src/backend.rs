use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::keys;
use crate::model::{StoreId, StoreMeta};

/// Uniform capability contract implemented by every backend adapter.
///
/// Implementations must be `Send + Sync` and safe for concurrent access;
/// callers needing concurrency must never be handed the same network
/// connection simultaneously (adapters pool or serialize internally).
///
/// The store-lifecycle operations (`create_or_get_store`, `find_store`,
/// `remove_store`, `store_meta`) have provided implementations composed from
/// the atomic meta primitives, so race-safe create-or-get is written once.
/// Adapters supply entry storage, the TTL namespace, and the primitives.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Name of the backing store product, for diagnostics.
    fn product_name(&self) -> &'static str;

    // ------------------------------------------------------------------
    // Store lifecycle (provided)
    // ------------------------------------------------------------------

    /// Create a store or fetch it if it already exists.
    ///
    /// Idempotent and race-safe: concurrent callers creating the same name
    /// all converge on a single id. A loser of the creation race abandons
    /// its reserved id, which is never reused.
    ///
    /// # Errors
    ///
    /// [`StoreError::StoreTypeConflict`] if the store exists with different
    /// key/value type hints.
    async fn create_or_get_store(
        &self,
        name: &str,
        key_type: &str,
        value_type: &str,
    ) -> Result<StoreId, StoreError> {
        let name_key = keys::store_name_key(name);

        if let Some(raw) = self.meta_get(&name_key).await? {
            let id = parse_store_id(&raw)?;
            let meta = require_meta(self, id).await?;
            return check_types(name, &meta, key_type, value_type).map(|()| id);
        }

        // Reserve a fresh id, then try to register the name atomically.
        let candidate = StoreId::new(self.meta_increment(keys::GUID_KEY).await?);
        if self
            .meta_check_and_set(&name_key, &candidate.to_string(), None)
            .await?
        {
            let meta = StoreMeta {
                name: name.to_owned(),
                key_type: key_type.to_owned(),
                value_type: value_type.to_owned(),
            };
            let doc = serde_json::to_string(&meta)
                .map_err(|e| StoreError::Data(format!("store meta encoding failed: {e}")))?;
            self.meta_set(&keys::store_info_key(candidate), &doc, None)
                .await?;
            tracing::debug!(store = name, id = %candidate, "created store");
            return Ok(candidate);
        }

        // Lost the race; converge on the winner's id. The reserved candidate
        // stays burned on the guid counter, exactly as documented.
        let raw = self.meta_get(&name_key).await?.ok_or_else(|| {
            StoreError::Data(format!(
                "store {name} vanished while resolving a creation race"
            ))
        })?;
        let id = parse_store_id(&raw)?;
        let meta = require_meta(self, id).await?;
        check_types(name, &meta, key_type, value_type).map(|()| id)
    }

    /// Look up a store by name. Returns `None` when no store is registered
    /// under that name.
    async fn find_store(&self, name: &str) -> Result<Option<StoreId>, StoreError> {
        match self.meta_get(&keys::store_name_key(name)).await? {
            Some(raw) => parse_store_id(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a store, its contents and its registration. Returns `true`
    /// if the store existed.
    async fn remove_store(&self, store: StoreId) -> Result<bool, StoreError> {
        let info_key = keys::store_info_key(store);
        let Some(doc) = self.meta_get(&info_key).await? else {
            return Ok(false);
        };
        let meta: StoreMeta = serde_json::from_str(&doc)
            .map_err(|e| StoreError::Data(format!("corrupt store meta for {store}: {e}")))?;

        self.clear(store).await?;
        self.meta_delete(&info_key).await?;
        self.meta_delete(&keys::store_name_key(&meta.name)).await?;
        tracing::debug!(store = meta.name, id = %store, "removed store");
        Ok(true)
    }

    /// Fetch a store's metadata record.
    ///
    /// # Errors
    ///
    /// [`StoreError::StoreNotFound`] if the id is not registered.
    async fn store_meta(&self, store: StoreId) -> Result<StoreMeta, StoreError> {
        require_meta(self, store).await
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    /// Store a key/value pair. Returns `true` if the key was not present
    /// before this call. The flag is advisory under concurrent writers on
    /// backends without a native conditional write.
    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError>;

    /// Fetch a value. Returns `None` when absent or expired.
    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a key. Returns `true` if it was present.
    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError>;

    /// Existence probe.
    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError>;

    /// Remove every entry in the store, keeping the store itself.
    async fn clear(&self, store: StoreId) -> Result<(), StoreError>;

    /// Number of entries currently in the store.
    async fn size(&self, store: StoreId) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // TTL namespace (global, store-less)
    // ------------------------------------------------------------------

    /// Store a key/value pair that the backend expires after `ttl`.
    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Fetch from the TTL namespace. Expired entries are never returned.
    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove from the TTL namespace. Returns `true` if a live entry existed.
    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Existence probe on the TTL namespace.
    async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Atomic meta primitives
    // ------------------------------------------------------------------

    /// Set `key` to `value` only if no live entry exists, as one atomic
    /// backend operation. Returns `true` if the value was newly set.
    ///
    /// This is the primitive the distributed lock claim rides on.
    async fn meta_check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Read a meta entry.
    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally write a meta entry.
    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Delete a meta entry. Returns `true` if it existed.
    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete a meta entry only if it currently holds `expected`. Returns
    /// `true` if the delete happened.
    async fn meta_compare_and_delete(&self, key: &str, expected: &str)
        -> Result<bool, StoreError>;

    /// Atomically increment a counter, creating it at zero first. Returns
    /// the new value.
    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Probe backend availability. Used by the retry policy between
    /// attempts.
    async fn ping(&self) -> Result<(), StoreError>;
}

fn parse_store_id(raw: &str) -> Result<StoreId, StoreError> {
    raw.parse::<StoreId>()
        .map_err(|e| StoreError::Data(format!("corrupt store id {raw:?}: {e}")))
}

async fn require_meta<B: KvBackend + ?Sized>(
    backend: &B,
    store: StoreId,
) -> Result<StoreMeta, StoreError> {
    let doc = backend
        .meta_get(&keys::store_info_key(store))
        .await?
        .ok_or_else(|| StoreError::StoreNotFound(store.to_string()))?;
    serde_json::from_str(&doc)
        .map_err(|e| StoreError::Data(format!("corrupt store meta for {store}: {e}")))
}

fn check_types(
    name: &str,
    meta: &StoreMeta,
    key_type: &str,
    value_type: &str,
) -> Result<(), StoreError> {
    if meta.key_type == key_type && meta.value_type == value_type {
        Ok(())
    } else {
        Err(StoreError::StoreTypeConflict {
            name: name.to_owned(),
            existing_key: meta.key_type.clone(),
            existing_value: meta.value_type.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify object safety; the engine holds adapters as Arc<dyn KvBackend>.
    fn _assert_dyn_backend(_: &dyn KvBackend) {}

    #[test]
    fn store_id_parsing_rejects_garbage() {
        assert!(parse_store_id("17").is_ok());
        assert!(matches!(
            parse_store_id("not-a-number"),
            Err(StoreError::Data(_))
        ));
    }

    #[test]
    fn type_check_flags_conflicts() {
        let meta = StoreMeta {
            name: "s".into(),
            key_type: "rstring".into(),
            value_type: "int64".into(),
        };
        assert!(check_types("s", &meta, "rstring", "int64").is_ok());
        assert!(matches!(
            check_types("s", &meta, "rstring", "float64"),
            Err(StoreError::StoreTypeConflict { .. })
        ));
    }
}
