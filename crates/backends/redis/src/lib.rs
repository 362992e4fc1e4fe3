//! Standalone Redis backend for procstore.
//!
//! Store contents live in one Redis hash per store id, so `clear` and
//! `size` are single commands. The TTL namespace uses plain keys with
//! native `SET ... EX` expiry. The atomic meta primitives ride on Lua
//! scripts (`SET NX PX`, fenced compare-and-delete), which is what gives
//! the distributed lock its mutual-exclusion guarantee on a single Redis
//! instance.
//!
//! Connections come from a `deadpool-redis` pool; credentials are part of
//! the connection URL so `AUTH` always precedes the first data command on
//! a fresh connection.

mod config;
pub mod scripts;
mod store;

pub use config::RedisBackendConfig;
pub use store::{map_redis_err, RedisBackend};
