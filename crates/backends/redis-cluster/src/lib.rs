//! Redis Cluster backend for procstore.
//!
//! Keys are routed to cluster nodes by CRC16 hash slot, honoring `{...}`
//! hash tags. A cached slot map drives first-try routing; `MOVED` and
//! `ASK` redirects from the server correct it. Each command invocation
//! follows at most one `MOVED` hop and at most one `ASK` hop before
//! giving up, so a flapping cluster cannot trap a caller in a redirect
//! loop.
//!
//! At most one connection is kept per node address, behind an async
//! mutex held for the duration of a command, so two in-flight commands
//! never share a connection. Credentials ride in the node URL, so a
//! freshly dialed connection authenticates before it carries any data
//! command.

mod config;
mod conn;
mod router;
pub mod slot;
mod store;
mod topology;

pub use config::RedisClusterConfig;
pub use store::RedisClusterBackend;
