use std::time::Duration;

use procstore_core::config::{EndpointSpec, DEFAULT_CONNECT_TIMEOUT};
use procstore_core::error::StoreError;

/// Default memcached port when an endpoint line omits one.
pub const DEFAULT_MEMCACHED_PORT: u16 = 11211;

/// Configuration for the memcached backend.
#[derive(Debug, Clone)]
pub struct MemcachedConfig {
    /// Server URLs (`memcache://host:port`). With several servers the
    /// client shards keys across them.
    pub servers: Vec<String>,

    /// Read/write timeout on established connections.
    pub io_timeout: Duration,

    /// Key prefix applied to every memcached key.
    pub prefix: String,
}

impl MemcachedConfig {
    /// Build a configuration from parsed endpoint lines.
    ///
    /// # Errors
    ///
    /// [`StoreError::Configuration`] if no endpoints were given.
    pub fn from_endpoints(specs: &[EndpointSpec]) -> Result<Self, StoreError> {
        let first = specs.first().ok_or_else(|| {
            StoreError::Configuration("memcached requires at least one server endpoint".into())
        })?;

        Ok(Self {
            servers: specs
                .iter()
                .map(|s| format!("memcache://{}", s.address(DEFAULT_MEMCACHED_PORT)))
                .collect(),
            io_timeout: first.connect_timeout,
            prefix: String::from("procstore"),
        })
    }
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            servers: vec![String::from("memcache://127.0.0.1:11211")],
            io_timeout: DEFAULT_CONNECT_TIMEOUT,
            prefix: String::from("procstore"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstore_core::config::EngineConfig;

    #[test]
    fn endpoints_become_server_urls() {
        let engine = EngineConfig::parse("memcached\nmc1\nmc2:11212\n").unwrap();
        let cfg = MemcachedConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(
            cfg.servers,
            vec!["memcache://mc1:11211", "memcache://mc2:11212"]
        );
    }
}
