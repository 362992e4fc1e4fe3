//! Process store engine: a shared key/value store facade and a
//! distributed lock manager over pluggable backends.
//!
//! The backend is selected from a small configuration file whose first
//! non-comment line names the product (`redis`, `redis-cluster`,
//! `cassandra`, ...) and whose remaining lines list endpoints. Every
//! adapter implements the same [`procstore_core::KvBackend`] contract,
//! so cooperating processes pointed at the same backend see one
//! namespace of stores and locks regardless of which adapter flavor
//! they run.
//!
//! ```no_run
//! # async fn demo() -> Result<(), procstore_core::StoreError> {
//! let config = procstore_core::EngineConfig::load("/etc/procstore.cfg")?;
//! let (stores, locks) = procstore::open(&config).await?;
//!
//! let id = stores.create_or_get_store("orders", "rstring", "blob").await?;
//! stores.put(id, b"o-17", b"pending").await?;
//!
//! let lock = locks.create_or_get_lock("orders-writer").await?;
//! locks.acquire(lock, Some(std::time::Duration::from_secs(30))).await?;
//! locks.release(lock).await?;
//! # Ok(())
//! # }
//! ```

mod connect;
mod lock;
mod retry;
mod store;

pub use connect::backend_from_config;
pub use lock::{LockManager, LockSettings};
pub use retry::{Retrier, RetryPolicy};
pub use store::StoreEngine;

use std::sync::Arc;

use procstore_core::{EngineConfig, StoreError};

/// Open the configured backend and wrap it in the store facade and the
/// lock manager. Both share one backend handle.
///
/// # Errors
///
/// Returns [`StoreError::Configuration`] for bad configuration and
/// [`StoreError::Connection`] when the backend cannot be reached.
pub async fn open(config: &EngineConfig) -> Result<(StoreEngine, LockManager), StoreError> {
    let backend = backend_from_config(config).await?;
    Ok((
        StoreEngine::new(Arc::clone(&backend), RetryPolicy::default()),
        LockManager::new(backend, LockSettings::default()),
    ))
}
