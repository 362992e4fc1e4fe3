//! Backend selection from parsed configuration.

use std::sync::Arc;

use procstore_cassandra::{CassandraBackend, CassandraConfig};
use procstore_cloudant::{CloudantBackend, CloudantConfig};
use procstore_core::config::EndpointSpec;
use procstore_core::{BackendKind, EngineConfig, KvBackend, StoreError};
use procstore_hbase::{HbaseBackend, HbaseConfig};
use procstore_memcached::{MemcachedBackend, MemcachedConfig};
use procstore_memory::MemoryBackend;
use procstore_mongo::{MongoBackend, MongoConfig};
use procstore_redis::{RedisBackend, RedisBackendConfig};
use procstore_redis_cluster::{RedisClusterBackend, RedisClusterConfig};

fn first_endpoint(config: &EngineConfig) -> Result<&EndpointSpec, StoreError> {
    config.endpoints.first().ok_or_else(|| {
        StoreError::Configuration(format!("backend {} has no endpoint", config.kind))
    })
}

/// Construct the adapter the configuration names.
///
/// Backends with an upfront handshake (cluster topology fetch, schema
/// creation) fail here rather than on first use, so a misconfigured
/// process dies at startup.
///
/// # Errors
///
/// Propagates the adapter's connect-time errors unchanged.
pub async fn backend_from_config(
    config: &EngineConfig,
) -> Result<Arc<dyn KvBackend>, StoreError> {
    let backend: Arc<dyn KvBackend> = match config.kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::Redis => {
            let spec = first_endpoint(config)?;
            Arc::new(RedisBackend::new(&RedisBackendConfig::from_endpoint(spec))?)
        }
        BackendKind::RedisCluster => {
            let cfg = RedisClusterConfig::from_endpoints(&config.endpoints)?;
            Arc::new(RedisClusterBackend::connect(&cfg).await?)
        }
        BackendKind::Memcached => {
            let cfg = MemcachedConfig::from_endpoints(&config.endpoints)?;
            Arc::new(MemcachedBackend::new(&cfg)?)
        }
        BackendKind::Cassandra => {
            let cfg = CassandraConfig::from_endpoints(&config.endpoints)?;
            Arc::new(CassandraBackend::connect(&cfg).await?)
        }
        BackendKind::Mongo => {
            let cfg = MongoConfig::from_endpoints(&config.endpoints)?;
            Arc::new(MongoBackend::connect(&cfg).await?)
        }
        BackendKind::Cloudant => {
            let cfg = CloudantConfig::from_endpoints(&config.endpoints)?;
            Arc::new(CloudantBackend::connect(&cfg).await?)
        }
        BackendKind::Hbase => {
            let cfg = HbaseConfig::from_endpoints(&config.endpoints)?;
            Arc::new(HbaseBackend::connect(&cfg).await?)
        }
    };
    tracing::info!(backend = backend.product_name(), "backend ready");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_needs_no_endpoints() {
        let config = EngineConfig::parse("memory\n").unwrap();
        let backend = backend_from_config(&config).await.unwrap();
        assert_eq!(backend.product_name(), "memory");
    }
}
