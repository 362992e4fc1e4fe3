//! Cloudant backend for procstore, speaking the CouchDB HTTP API.
//!
//! Every record is a JSON document in one database; binary keys and
//! values travel base64-encoded. Concurrency control is Cloudant's
//! native MVCC: a `PUT` without `_rev` is the set-if-absent primitive
//! (409 means someone else holds the id), and a `DELETE` pinned to the
//! `_rev` that was read is the fenced delete (409 means the document
//! changed underneath).
//!
//! Cloudant has no server-side expiry, so TTL records store an
//! `expires_at` timestamp and reads treat anything within one second of
//! its deadline as gone, absorbing modest clock differences. Expired
//! leftovers are deleted opportunistically when a read trips over them.
//!
//! Store scans use `_all_docs` with id-prefix ranges.

mod config;
mod store;

pub use config::CloudantConfig;
pub use store::CloudantBackend;
