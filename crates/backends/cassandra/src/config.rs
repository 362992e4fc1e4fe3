use std::time::Duration;

use procstore_core::config::{EndpointSpec, DEFAULT_CONNECT_TIMEOUT};
use procstore_core::error::StoreError;

/// Default CQL native protocol port.
pub const DEFAULT_CQL_PORT: u16 = 9042;

/// Configuration for the Cassandra backend.
#[derive(Debug, Clone)]
pub struct CassandraConfig {
    /// Contact points (`host:port`).
    pub nodes: Vec<String>,

    /// Credentials, if the cluster requires authentication.
    pub user: Option<String>,
    pub password: Option<String>,

    /// Keyspace holding the procstore tables; created on connect if
    /// missing.
    pub keyspace: String,

    /// Replication factor used when the keyspace has to be created.
    pub replication_factor: u32,

    /// Bounded timeout for dialing contact points.
    pub connect_timeout: Duration,
}

impl CassandraConfig {
    /// Build a configuration from parsed endpoint lines. A password on
    /// the first endpoint enables authentication with the stock
    /// `cassandra` superuser name.
    ///
    /// # Errors
    ///
    /// [`StoreError::Configuration`] if no endpoints were given.
    pub fn from_endpoints(specs: &[EndpointSpec]) -> Result<Self, StoreError> {
        let first = specs.first().ok_or_else(|| {
            StoreError::Configuration("cassandra requires at least one contact point".into())
        })?;

        Ok(Self {
            nodes: specs.iter().map(|s| s.address(DEFAULT_CQL_PORT)).collect(),
            user: first.password.as_ref().map(|_| String::from("cassandra")),
            password: first.password.clone(),
            connect_timeout: first.connect_timeout,
            ..Self::default()
        })
    }
}

impl Default for CassandraConfig {
    fn default() -> Self {
        Self {
            nodes: vec![String::from("127.0.0.1:9042")],
            user: None,
            password: None,
            keyspace: String::from("procstore"),
            replication_factor: 1,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstore_core::config::EngineConfig;

    #[test]
    fn endpoints_become_contact_points() {
        let engine = EngineConfig::parse("cassandra\ncas1\ncas2:9043:secret\n").unwrap();
        let cfg = CassandraConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(cfg.nodes, vec!["cas1:9042", "cas2:9043"]);
        assert_eq!(cfg.user, None);
        assert_eq!(cfg.keyspace, "procstore");
    }

    #[test]
    fn password_enables_authentication() {
        let engine = EngineConfig::parse("cassandra\ncas1:9042:secret\n").unwrap();
        let cfg = CassandraConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(cfg.user.as_deref(), Some("cassandra"));
        assert_eq!(cfg.password.as_deref(), Some("secret"));
    }
}
