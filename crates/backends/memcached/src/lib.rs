//! Memcached backend for procstore.
//!
//! Memcached offers no enumeration, so a store cannot be cleared by
//! scanning its keys. Instead every entry key carries the store's
//! generation number; `clear` bumps the generation, orphaning the old
//! entries for the server's LRU to reclaim. Entry counts ride on a
//! per-generation counter maintained with `incr`/`decr`.
//!
//! The `add` command gives an atomic set-if-absent, which backs both the
//! put new-flag and the meta check-and-set the lock claim uses. The
//! fenced compare-and-delete is read-compare-delete; memcached has no
//! conditional delete, so a narrow race window remains there.
//!
//! The `memcache` client is synchronous; calls hop through
//! `spawn_blocking`.

mod config;
mod store;

pub use config::MemcachedConfig;
pub use store::MemcachedBackend;
