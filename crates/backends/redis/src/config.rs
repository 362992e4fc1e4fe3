use std::time::Duration;

use procstore_core::config::EndpointSpec;

/// Default Redis port when an endpoint line omits one.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Configuration for the standalone Redis backend.
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`). Credentials
    /// belong in the URL so authentication happens at connection setup.
    pub url: String,

    /// Key prefix applied to every Redis key to avoid collisions.
    pub prefix: String,

    /// Number of connections in the `deadpool-redis` pool.
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            prefix: String::from("procstore"),
            pool_size: 10,
            connection_timeout: Duration::from_secs(3),
        }
    }
}

impl RedisBackendConfig {
    /// Build a configuration from a parsed endpoint line.
    #[must_use]
    pub fn from_endpoint(spec: &EndpointSpec) -> Self {
        Self {
            url: spec.redis_url(DEFAULT_REDIS_PORT),
            connection_timeout: spec.connect_timeout,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = RedisBackendConfig::default();
        assert_eq!(cfg.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.prefix, "procstore");
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.connection_timeout, Duration::from_secs(3));
    }
}
