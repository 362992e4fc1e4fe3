//! MongoDB backend for procstore.
//!
//! Entries key on a compound `_id` of store id and raw key bytes, so the
//! unique index the server keeps on `_id` doubles as the conditional
//! write: a duplicate-key error (code 11000) is the "already present"
//! signal behind check-and-set. Fenced deletes use `findOneAndDelete`
//! with the expected value in the filter, and the guid counter is a
//! single upserted `$inc`.
//!
//! TTL entries carry an `expires_at` date covered by a TTL index. The
//! server's expiry monitor only sweeps about once a minute, so every
//! read also filters on `expires_at` rather than trusting the sweep.

mod config;
mod store;

pub use config::MongoConfig;
pub use store::MongoBackend;
