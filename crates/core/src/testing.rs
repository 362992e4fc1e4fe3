//! Conformance test suites shared by every backend adapter.
//!
//! Call these from an adapter's test module with a fresh instance (point
//! real backends at a unique key prefix per run, the way the integration
//! tests do).

use std::time::Duration;

use crate::backend::KvBackend;
use crate::error::StoreError;

/// Run the full backend conformance suite.
///
/// # Errors
///
/// Returns an error if any conformance check fails.
pub async fn run_backend_conformance(backend: &dyn KvBackend) -> Result<(), StoreError> {
    store_lifecycle(backend).await?;
    entry_round_trip(backend).await?;
    entry_bookkeeping(backend).await?;
    ttl_namespace(backend).await?;
    meta_primitives(backend).await?;
    backend.ping().await?;
    Ok(())
}

async fn store_lifecycle(backend: &dyn KvBackend) -> Result<(), StoreError> {
    let id = backend
        .create_or_get_store("conf-store", "rstring", "rstring")
        .await?;

    // Same name and types: converge on the same id.
    let again = backend
        .create_or_get_store("conf-store", "rstring", "rstring")
        .await?;
    assert_eq!(id, again, "create_or_get_store should be idempotent");

    let found = backend.find_store("conf-store").await?;
    assert_eq!(found, Some(id), "find_store should see the created store");

    // Different type hints must be rejected, not silently merged.
    let conflict = backend
        .create_or_get_store("conf-store", "rstring", "int64")
        .await;
    assert!(
        matches!(conflict, Err(StoreError::StoreTypeConflict { .. })),
        "type-hint mismatch should conflict"
    );

    let meta = backend.store_meta(id).await?;
    assert_eq!(meta.name, "conf-store");
    assert_eq!(meta.key_type, "rstring");

    let removed = backend.remove_store(id).await?;
    assert!(removed, "remove_store should report the store existed");
    assert_eq!(backend.find_store("conf-store").await?, None);
    assert!(!backend.remove_store(id).await?, "second removal is a no-op");
    Ok(())
}

async fn entry_round_trip(backend: &dyn KvBackend) -> Result<(), StoreError> {
    let id = backend
        .create_or_get_store("conf-entries", "rstring", "blob")
        .await?;

    assert_eq!(backend.get(id, b"k1").await?, None);

    let was_new = backend.put(id, b"k1", b"v1").await?;
    assert!(was_new, "first put should report a new key");
    assert_eq!(backend.get(id, b"k1").await?.as_deref(), Some(&b"v1"[..]));

    let was_new = backend.put(id, b"k1", b"v2").await?;
    assert!(!was_new, "overwrite should not report a new key");
    assert_eq!(backend.get(id, b"k1").await?.as_deref(), Some(&b"v2"[..]));

    // Values are opaque bytes; nothing may assume text encoding.
    let binary = [0u8, 159, 146, 150, 255];
    backend.put(id, &binary, &binary).await?;
    assert_eq!(backend.get(id, &binary).await?.as_deref(), Some(&binary[..]));

    assert!(backend.has(id, b"k1").await?);
    assert!(backend.remove(id, b"k1").await?);
    assert!(!backend.has(id, b"k1").await?);
    assert!(!backend.remove(id, b"k1").await?);
    assert_eq!(backend.get(id, b"k1").await?, None);

    backend.remove_store(id).await?;
    Ok(())
}

async fn entry_bookkeeping(backend: &dyn KvBackend) -> Result<(), StoreError> {
    let id = backend
        .create_or_get_store("conf-size", "rstring", "rstring")
        .await?;

    assert_eq!(backend.size(id).await?, 0);
    backend.put(id, b"a", b"1").await?;
    backend.put(id, b"b", b"2").await?;
    backend.put(id, b"b", b"3").await?;
    assert_eq!(backend.size(id).await?, 2, "overwrites should not grow size");

    backend.clear(id).await?;
    assert_eq!(backend.size(id).await?, 0);
    assert_eq!(backend.get(id, b"a").await?, None);

    // The store itself survives a clear.
    assert_eq!(backend.find_store("conf-size").await?, Some(id));

    backend.remove_store(id).await?;
    Ok(())
}

async fn ttl_namespace(backend: &dyn KvBackend) -> Result<(), StoreError> {
    let ttl = Duration::from_secs(3600);

    backend.put_ttl(b"ttl-k", b"ttl-v", ttl).await?;
    assert_eq!(
        backend.get_ttl(b"ttl-k").await?.as_deref(),
        Some(&b"ttl-v"[..])
    );
    assert!(backend.has_ttl(b"ttl-k").await?);

    assert!(backend.remove_ttl(b"ttl-k").await?);
    assert!(!backend.has_ttl(b"ttl-k").await?);
    assert!(!backend.remove_ttl(b"ttl-k").await?);
    Ok(())
}

async fn meta_primitives(backend: &dyn KvBackend) -> Result<(), StoreError> {
    // Conditional set only wins once.
    assert!(backend.meta_check_and_set("conf:cas", "first", None).await?);
    assert!(!backend.meta_check_and_set("conf:cas", "second", None).await?);
    assert_eq!(
        backend.meta_get("conf:cas").await?.as_deref(),
        Some("first")
    );

    // Compare-and-delete is fenced on the stored value.
    assert!(!backend.meta_compare_and_delete("conf:cas", "second").await?);
    assert!(backend.meta_compare_and_delete("conf:cas", "first").await?);
    assert_eq!(backend.meta_get("conf:cas").await?, None);

    backend.meta_set("conf:plain", "v", None).await?;
    assert!(backend.meta_delete("conf:plain").await?);
    assert!(!backend.meta_delete("conf:plain").await?);

    let one = backend.meta_increment("conf:ctr").await?;
    let two = backend.meta_increment("conf:ctr").await?;
    assert_eq!(one + 1, two, "increment should be sequential");
    backend.meta_delete("conf:ctr").await?;
    Ok(())
}
