//! HBase backend for procstore, going through the HBase REST gateway.
//!
//! All records live in one table under a single column family; payloads
//! travel base64-encoded as the REST protocol requires. Store scans use
//! the gateway's stateful scanner resource with row-prefix bounds.
//!
//! The REST gateway exposes no check-and-put, so the conditional
//! primitives here are read-then-write with a window between the two
//! steps. Two processes racing for the same lock can in principle both
//! see it free; deployments needing a hard mutual-exclusion guarantee
//! should prefer one of the backends with native conditional writes.
//!
//! HBase cell TTLs are table-level, so per-record expiry is emulated
//! with a stored deadline, read-side filtering (one second early, to
//! absorb clock skew) and lazy deletion of expired leftovers.

mod config;
mod store;

pub use config::HbaseConfig;
pub use store::HbaseBackend;
