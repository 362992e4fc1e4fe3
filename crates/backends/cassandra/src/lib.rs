//! Cassandra backend for procstore, speaking CQL through the scylla
//! driver (compatible with both Cassandra and ScyllaDB).
//!
//! A store maps to one partition of the `entries` table, so `clear` is a
//! partition delete and `size` a partition count. Conditional writes use
//! lightweight transactions (`IF NOT EXISTS`, `IF value = ?`), which is
//! what the lock claim and fenced release ride on. The guid counter is a
//! bounded LWT compare-and-swap loop because native counter columns
//! cannot be read back atomically with their increment.
//!
//! TTLs map to native `USING TTL`.

mod config;
mod store;

pub use config::CassandraConfig;
pub use store::CassandraBackend;
