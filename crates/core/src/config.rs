use std::path::Path;
use std::time::Duration;

use crate::error::StoreError;

/// Default bounded connect timeout per endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// The closed set of supported backend products.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
    RedisCluster,
    Memcached,
    Cassandra,
    Mongo,
    Cloudant,
    Hbase,
}

impl BackendKind {
    /// Every name accepted in a configuration file.
    pub const SUPPORTED: &'static [&'static str] = &[
        "memory",
        "redis",
        "redis-cluster",
        "redis-cluster-plus-plus",
        "memcached",
        "cassandra",
        "mongo",
        "cloudant",
        "hbase",
    ];
}

impl std::str::FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Both cluster layer names from older deployments select the same
        // cluster adapter here.
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "redis-cluster" | "redis-cluster-plus-plus" => Ok(Self::RedisCluster),
            "memcached" => Ok(Self::Memcached),
            "cassandra" => Ok(Self::Cassandra),
            "mongo" => Ok(Self::Mongo),
            "cloudant" => Ok(Self::Cloudant),
            "hbase" => Ok(Self::Hbase),
            other => Err(StoreError::Configuration(format!(
                "unknown backend {other:?}; supported backends: {}",
                Self::SUPPORTED.join(", ")
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::RedisCluster => "redis-cluster",
            Self::Memcached => "memcached",
            Self::Cassandra => "cassandra",
            Self::Mongo => "mongo",
            Self::Cloudant => "cloudant",
            Self::Hbase => "hbase",
        };
        f.write_str(name)
    }
}

/// One backend endpoint parsed from a configuration line.
///
/// Redis-family lines are positional:
/// `host:port:password:timeoutSeconds:useTLS[:certPath:keyPath:caPath]`,
/// with every field after `host` optional. Lines containing `://` are kept
/// verbatim as connection URLs (Mongo, Cloudant, HBase REST).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub host: String,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub use_tls: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub ca_path: Option<String>,
    /// The raw configuration line, for URL-style endpoints.
    pub raw: String,
}

impl EndpointSpec {
    fn parse(line: &str) -> Result<Self, StoreError> {
        if line.contains("://") {
            return Ok(Self {
                host: line.to_owned(),
                port: None,
                password: None,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                use_tls: false,
                cert_path: None,
                key_path: None,
                ca_path: None,
                raw: line.to_owned(),
            });
        }

        let fields: Vec<&str> = line.split(':').collect();
        let host = fields[0].trim();
        if host.is_empty() {
            return Err(StoreError::Configuration(format!(
                "endpoint line {line:?} has no host"
            )));
        }

        let non_empty = |idx: usize| {
            fields
                .get(idx)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        let port = match non_empty(1) {
            Some(p) => Some(p.parse::<u16>().map_err(|e| {
                StoreError::Configuration(format!("bad port in endpoint {line:?}: {e}"))
            })?),
            None => None,
        };

        let connect_timeout = match non_empty(3) {
            Some(t) => {
                let secs = t.parse::<f64>().map_err(|e| {
                    StoreError::Configuration(format!("bad timeout in endpoint {line:?}: {e}"))
                })?;
                if secs <= 0.0 {
                    return Err(StoreError::Configuration(format!(
                        "timeout in endpoint {line:?} must be positive"
                    )));
                }
                Duration::from_secs_f64(secs)
            }
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        let use_tls = match non_empty(4).as_deref() {
            Some("true" | "1") => true,
            Some("false" | "0") | None => false,
            Some(other) => {
                return Err(StoreError::Configuration(format!(
                    "bad TLS flag {other:?} in endpoint {line:?}"
                )))
            }
        };

        Ok(Self {
            host: host.to_owned(),
            port,
            password: non_empty(2),
            connect_timeout,
            use_tls,
            cert_path: non_empty(5),
            key_path: non_empty(6),
            ca_path: non_empty(7),
            raw: line.to_owned(),
        })
    }

    /// Render this endpoint as a Redis connection URL, embedding the
    /// password so authentication happens during connection setup, before
    /// any data command.
    #[must_use]
    pub fn redis_url(&self, default_port: u16) -> String {
        let scheme = if self.use_tls { "rediss" } else { "redis" };
        let auth = self
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!(
            "{scheme}://{auth}{}:{}",
            self.host,
            self.port.unwrap_or(default_port)
        )
    }

    /// Render this endpoint as `host:port`.
    #[must_use]
    pub fn address(&self, default_port: u16) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(default_port))
    }
}

/// Parsed engine configuration: which backend to use and where it lives.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub kind: BackendKind,
    pub endpoints: Vec<EndpointSpec>,
}

impl EngineConfig {
    /// Parse configuration text.
    ///
    /// Comment lines start with `#`; the first non-comment line names the
    /// backend product; each following non-comment line is one endpoint.
    ///
    /// # Errors
    ///
    /// [`StoreError::Configuration`] if the product line is missing or
    /// unknown, or if no endpoint lines follow (the memory backend alone
    /// needs no endpoints).
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let mut kind: Option<BackendKind> = None;
        let mut endpoints = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match kind {
                None => kind = Some(line.parse()?),
                Some(_) => endpoints.push(EndpointSpec::parse(line)?),
            }
        }

        let kind = kind.ok_or_else(|| {
            StoreError::Configuration(
                "configuration names no backend product on its first non-comment line".into(),
            )
        })?;

        if endpoints.is_empty() && kind != BackendKind::Memory {
            return Err(StoreError::Configuration(format!(
                "backend {kind} requires at least one endpoint line"
            )));
        }

        Ok(Self { kind, endpoints })
    }

    /// Load and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Configuration(format!(
                "cannot read configuration file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_redis_with_all_fields() {
        let cfg = EngineConfig::parse(
            "# cluster servers\nredis\nlocalhost:6379:secret:5:true:/c.pem:/k.pem:/ca.pem\n",
        )
        .unwrap();
        assert_eq!(cfg.kind, BackendKind::Redis);
        let ep = &cfg.endpoints[0];
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, Some(6379));
        assert_eq!(ep.password.as_deref(), Some("secret"));
        assert_eq!(ep.connect_timeout, Duration::from_secs(5));
        assert!(ep.use_tls);
        assert_eq!(ep.cert_path.as_deref(), Some("/c.pem"));
    }

    #[test]
    fn defaults_apply_after_host() {
        let cfg = EngineConfig::parse("redis\nlocalhost\n").unwrap();
        let ep = &cfg.endpoints[0];
        assert_eq!(ep.port, None);
        assert_eq!(ep.password, None);
        assert_eq!(ep.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(!ep.use_tls);
        assert_eq!(ep.redis_url(6379), "redis://localhost:6379");
    }

    #[test]
    fn url_lines_pass_through() {
        let cfg = EngineConfig::parse("mongo\nmongodb://user:pw@db1:27017\n").unwrap();
        assert_eq!(cfg.endpoints[0].raw, "mongodb://user:pw@db1:27017");
    }

    #[test]
    fn cluster_alias_maps_to_cluster() {
        let cfg = EngineConfig::parse("redis-cluster-plus-plus\nnode1:7000\n").unwrap();
        assert_eq!(cfg.kind, BackendKind::RedisCluster);
    }

    #[test]
    fn missing_product_line_is_fatal() {
        let err = EngineConfig::parse("# only comments\n").unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn unknown_product_is_fatal() {
        let err = EngineConfig::parse("oracle\nhost:1521\n").unwrap_err();
        assert!(err.to_string().contains("supported backends"));
    }

    #[test]
    fn missing_endpoints_are_fatal_except_memory() {
        assert!(EngineConfig::parse("redis\n").is_err());
        assert!(EngineConfig::parse("memory\n").is_ok());
    }

    #[test]
    fn password_embedded_in_redis_url() {
        let cfg = EngineConfig::parse("redis\nh:6380:pw\n").unwrap();
        assert_eq!(cfg.endpoints[0].redis_url(6379), "redis://:pw@h:6380");
    }
}
