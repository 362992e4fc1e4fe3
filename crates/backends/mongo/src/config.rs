use std::time::Duration;

use procstore_core::config::{EndpointSpec, DEFAULT_CONNECT_TIMEOUT};
use procstore_core::error::StoreError;

/// Default MongoDB port when an endpoint line omits one.
pub const DEFAULT_MONGO_PORT: u16 = 27017;

/// Configuration for the MongoDB backend.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// Connection string. Endpoint lines that already look like
    /// `mongodb://...` URLs pass through verbatim; positional lines are
    /// assembled into one.
    pub uri: String,

    /// Database holding the procstore collections.
    pub database: String,

    /// Bounded timeout for dialing and server selection.
    pub connect_timeout: Duration,
}

impl MongoConfig {
    /// Build a configuration from parsed endpoint lines.
    ///
    /// # Errors
    ///
    /// [`StoreError::Configuration`] if no endpoints were given.
    pub fn from_endpoints(specs: &[EndpointSpec]) -> Result<Self, StoreError> {
        let first = specs.first().ok_or_else(|| {
            StoreError::Configuration("mongo requires at least one endpoint".into())
        })?;

        let uri = if first.raw.contains("://") {
            first.raw.clone()
        } else {
            let hosts = specs
                .iter()
                .map(|s| s.address(DEFAULT_MONGO_PORT))
                .collect::<Vec<_>>()
                .join(",");
            match &first.password {
                Some(pw) => format!("mongodb://:{pw}@{hosts}"),
                None => format!("mongodb://{hosts}"),
            }
        };

        Ok(Self {
            uri,
            database: String::from("procstore"),
            connect_timeout: first.connect_timeout,
        })
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: String::from("mongodb://127.0.0.1:27017"),
            database: String::from("procstore"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstore_core::config::EngineConfig;

    #[test]
    fn url_endpoint_passes_through() {
        let engine = EngineConfig::parse("mongo\nmongodb://u:p@db1:27017/?tls=true\n").unwrap();
        let cfg = MongoConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(cfg.uri, "mongodb://u:p@db1:27017/?tls=true");
    }

    #[test]
    fn positional_endpoints_become_a_uri() {
        let engine = EngineConfig::parse("mongo\ndb1\ndb2:27018\n").unwrap();
        let cfg = MongoConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(cfg.uri, "mongodb://db1:27017,db2:27018");
    }
}
