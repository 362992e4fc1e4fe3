//! Core contracts for procstore.
//!
//! This crate defines everything the backend adapter crates and the engine
//! share: the [`KvBackend`] capability trait, the normalized [`StoreError`]
//! taxonomy, the store/lock data model, and the configuration-file parser.
//!
//! Backend adapters live in their own crates (`procstore-redis`,
//! `procstore-memcached`, ...) and implement [`KvBackend`]; the engine crate
//! (`procstore`) selects one adapter from configuration and layers the store
//! facade and the distributed lock manager on top.

pub mod backend;
pub mod config;
pub mod error;
pub mod keys;
pub mod model;
pub mod testing;

pub use backend::KvBackend;
pub use config::{BackendKind, EndpointSpec, EngineConfig};
pub use error::StoreError;
pub use model::{lock_id_for_name, LockId, LockRecord, StoreId, StoreMeta};
