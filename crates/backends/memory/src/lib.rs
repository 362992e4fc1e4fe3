//! In-memory backend for procstore.
//!
//! Backed by [`DashMap`]; entries with a TTL are lazily evicted on read.
//! This adapter exists for tests and local development: it exercises the
//! same capability contract as the networked backends, including the atomic
//! meta primitives the lock manager relies on.

mod store;

pub use store::MemoryBackend;
