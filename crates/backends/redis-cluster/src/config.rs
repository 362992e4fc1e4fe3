use std::time::Duration;

use procstore_core::config::{EndpointSpec, DEFAULT_CONNECT_TIMEOUT};
use procstore_core::error::StoreError;

/// Default Redis Cluster port when an endpoint line omits one.
pub const DEFAULT_CLUSTER_PORT: u16 = 6379;

/// Configuration for the Redis Cluster backend.
///
/// Cluster deployments share one password across nodes, so the password,
/// TLS flag and connect timeout come from the first endpoint line and
/// apply to every node the router dials, including nodes discovered
/// through redirects that never appeared in the configuration file.
#[derive(Debug, Clone)]
pub struct RedisClusterConfig {
    /// Seed node addresses (`host:port`) used for initial topology
    /// discovery and as fallbacks when the slot map has no owner.
    pub seeds: Vec<String>,

    /// Password applied to every node connection, if any.
    pub password: Option<String>,

    /// Dial nodes over TLS.
    pub use_tls: bool,

    /// Bounded timeout for dialing a node.
    pub connect_timeout: Duration,

    /// Key prefix applied to every Redis key.
    pub prefix: String,
}

impl RedisClusterConfig {
    /// Build a configuration from parsed endpoint lines.
    ///
    /// # Errors
    ///
    /// [`StoreError::Configuration`] if no endpoints were given.
    pub fn from_endpoints(specs: &[EndpointSpec]) -> Result<Self, StoreError> {
        let first = specs.first().ok_or_else(|| {
            StoreError::Configuration("redis-cluster requires at least one seed endpoint".into())
        })?;

        Ok(Self {
            seeds: specs
                .iter()
                .map(|s| s.address(DEFAULT_CLUSTER_PORT))
                .collect(),
            password: first.password.clone(),
            use_tls: first.use_tls,
            connect_timeout: first.connect_timeout,
            prefix: String::from("procstore"),
        })
    }
}

impl Default for RedisClusterConfig {
    fn default() -> Self {
        Self {
            seeds: vec![String::from("127.0.0.1:6379")],
            password: None,
            use_tls: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            prefix: String::from("procstore"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstore_core::config::EngineConfig;

    #[test]
    fn first_endpoint_sets_shared_settings() {
        let engine =
            EngineConfig::parse("redis-cluster\nnode1:7000:pw:5:false\nnode2:7001\n").unwrap();
        let cfg = RedisClusterConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(cfg.seeds, vec!["node1:7000", "node2:7001"]);
        assert_eq!(cfg.password.as_deref(), Some("pw"));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert!(!cfg.use_tls);
    }

    #[test]
    fn empty_endpoint_list_is_rejected() {
        assert!(matches!(
            RedisClusterConfig::from_endpoints(&[]),
            Err(StoreError::Configuration(_))
        ));
    }
}
