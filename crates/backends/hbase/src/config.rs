use std::time::Duration;

use procstore_core::config::{EndpointSpec, DEFAULT_CONNECT_TIMEOUT};
use procstore_core::error::StoreError;

/// Default HBase REST gateway port.
pub const DEFAULT_HBASE_REST_PORT: u16 = 8080;

/// Configuration for the HBase REST backend.
#[derive(Debug, Clone)]
pub struct HbaseConfig {
    /// REST gateway root, scheme included, no trailing slash.
    pub base_url: String,

    /// Basic-auth credentials, if the gateway requires them.
    pub username: Option<String>,
    pub password: Option<String>,

    /// Table holding every procstore row; created on connect if missing.
    pub table: String,

    /// Request timeout covering connect and response.
    pub timeout: Duration,
}

impl HbaseConfig {
    /// Build a configuration from parsed endpoint lines. URL lines pass
    /// through; positional lines become `http://host:port`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Configuration`] if no endpoints were given.
    pub fn from_endpoints(specs: &[EndpointSpec]) -> Result<Self, StoreError> {
        let first = specs.first().ok_or_else(|| {
            StoreError::Configuration("hbase requires at least one REST endpoint".into())
        })?;

        let base_url = if first.raw.contains("://") {
            first.raw.trim_end_matches('/').to_owned()
        } else {
            let scheme = if first.use_tls { "https" } else { "http" };
            format!("{scheme}://{}", first.address(DEFAULT_HBASE_REST_PORT))
        };

        Ok(Self {
            base_url,
            username: first.password.as_ref().map(|_| String::from("hbase")),
            password: first.password.clone(),
            table: String::from("procstore"),
            timeout: first.connect_timeout,
        })
    }
}

impl Default for HbaseConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("http://127.0.0.1:8080"),
            username: None,
            password: None,
            table: String::from("procstore"),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstore_core::config::EngineConfig;

    #[test]
    fn positional_line_becomes_gateway_url() {
        let engine = EngineConfig::parse("hbase\nregion1\n").unwrap();
        let cfg = HbaseConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(cfg.base_url, "http://region1:8080");
        assert_eq!(cfg.table, "procstore");
    }

    #[test]
    fn url_line_passes_through() {
        let engine = EngineConfig::parse("hbase\nhttps://gw.example.com:8443/\n").unwrap();
        let cfg = HbaseConfig::from_endpoints(&engine.endpoints).unwrap();
        assert_eq!(cfg.base_url, "https://gw.example.com:8443");
    }
}
