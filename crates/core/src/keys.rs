//! Meta-namespace key rendering shared by all adapters.
//!
//! Adapters apply their own backend prefix on top of these names; the layout
//! below is what makes stores and locks created by one process visible to
//! every other process using the same backend.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::model::{LockId, StoreId};

/// Counter key from which store ids are allocated.
pub const GUID_KEY: &str = "guid";

/// Encode arbitrary bytes into a form safe for text-keyed backends
/// (memcached key rules, document ids, REST path segments).
#[must_use]
pub fn render_binary(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Meta key mapping a store name to its id.
#[must_use]
pub fn store_name_key(name: &str) -> String {
    format!("store:name:{}", render_binary(name.as_bytes()))
}

/// Meta key holding a store's [`StoreMeta`](crate::model::StoreMeta) record.
#[must_use]
pub fn store_info_key(store: StoreId) -> String {
    format!("store:info:{store}")
}

/// Meta key holding a lock's owner record.
#[must_use]
pub fn lock_key(lock: LockId) -> String {
    format!("lock:{lock}")
}

/// Meta key registering a lock's name, kept for inspection tooling.
#[must_use]
pub fn lock_name_key(lock: LockId) -> String {
    format!("lock:name:{lock}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_rendering_is_key_safe() {
        let rendered = render_binary(b"some key with spaces\x00\xff");
        assert!(!rendered.contains(' '));
        assert!(!rendered.contains(':'));
    }

    #[test]
    fn store_keys_embed_id() {
        let id = StoreId::new(9);
        assert_eq!(store_info_key(id), "store:info:9");
    }

    #[test]
    fn name_keys_differ_per_name() {
        assert_ne!(store_name_key("a"), store_name_key("b"));
    }
}
