//! Per-node connection management.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use procstore_core::error::StoreError;
use procstore_redis::map_redis_err;

use crate::config::RedisClusterConfig;
use crate::router::{parse_redirect, NodeError, NodeLink};
use crate::topology::{parse_cluster_slots, SlotRange};

type NodeSlot = Arc<Mutex<Option<MultiplexedConnection>>>;

/// Keeps at most one connection per node address, dialing lazily.
///
/// Credentials and the TLS flag are baked into each node URL, so `AUTH`
/// runs during connection setup, ahead of any data command. Each node's
/// connection sits behind an async mutex held for the duration of one
/// command, so two in-flight commands never share a connection. A
/// connection-level failure clears the slot and the next request redials.
pub(crate) struct ConnectionManager {
    password: Option<String>,
    use_tls: bool,
    connect_timeout: Duration,
    conns: DashMap<String, NodeSlot>,
}

impl ConnectionManager {
    pub fn new(config: &RedisClusterConfig) -> Self {
        Self {
            password: config.password.clone(),
            use_tls: config.use_tls,
            connect_timeout: config.connect_timeout,
            conns: DashMap::new(),
        }
    }

    fn node_url(&self, addr: &str) -> String {
        let scheme = if self.use_tls { "rediss" } else { "redis" };
        let auth = self
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!("{scheme}://{auth}{addr}")
    }

    /// The mutex slot for one endpoint. Lock it before touching the
    /// connection and keep it locked until the command completes.
    fn slot(&self, addr: &str) -> NodeSlot {
        self.conns.entry(addr.to_owned()).or_default().clone()
    }

    async fn dial(&self, addr: &str) -> Result<MultiplexedConnection, StoreError> {
        let client =
            redis::Client::open(self.node_url(addr)).map_err(|e| map_redis_err(&e))?;
        tokio::time::timeout(
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            StoreError::Connection(format!(
                "timed out dialing cluster node {addr} after {:?}",
                self.connect_timeout
            ))
        })?
        .map_err(|e| map_redis_err(&e))
    }

    /// Return the cached connection for a locked slot, dialing if empty.
    async fn lease(
        &self,
        addr: &str,
        slot: &mut Option<MultiplexedConnection>,
    ) -> Result<MultiplexedConnection, StoreError> {
        match slot.as_ref() {
            Some(conn) => Ok(conn.clone()),
            None => {
                let conn = self.dial(addr).await?;
                *slot = Some(conn.clone());
                Ok(conn)
            }
        }
    }
}

/// [`NodeLink`] implementation over real node connections.
pub(crate) struct ConnLink {
    manager: ConnectionManager,
}

impl ConnLink {
    pub fn new(config: &RedisClusterConfig) -> Self {
        Self {
            manager: ConnectionManager::new(config),
        }
    }
}

#[async_trait]
impl NodeLink for ConnLink {
    async fn request(
        &self,
        addr: &str,
        cmd: &redis::Cmd,
        asking: bool,
    ) -> Result<redis::Value, NodeError> {
        let slot = self.manager.slot(addr);
        let mut guard = slot.lock().await;
        let mut conn = self
            .manager
            .lease(addr, &mut guard)
            .await
            .map_err(NodeError::Store)?;

        let result = if asking {
            // ASKING and the command travel as one pipeline so nothing
            // can interleave between them on the connection.
            let mut pipe = redis::pipe();
            pipe.cmd("ASKING").ignore();
            pipe.add_command(cmd.clone());
            pipe.query_async::<(redis::Value,)>(&mut conn)
                .await
                .map(|(value,)| value)
        } else {
            cmd.query_async::<redis::Value>(&mut conn).await
        };

        result.map_err(|e| match parse_redirect(&e) {
            Some(redirect) => NodeError::Redirect(redirect),
            None => {
                let mapped = map_redis_err(&e);
                if mapped.is_retryable() {
                    *guard = None;
                }
                NodeError::Store(mapped)
            }
        })
    }

    async fn fetch_slots(&self, addr: &str) -> Result<Vec<SlotRange>, StoreError> {
        let slot = self.manager.slot(addr);
        let mut guard = slot.lock().await;
        let mut conn = self.manager.lease(addr, &mut guard).await?;

        let value = redis::cmd("CLUSTER")
            .arg("SLOTS")
            .query_async::<redis::Value>(&mut conn)
            .await
            .map_err(|e| {
                let mapped = map_redis_err(&e);
                if mapped.is_retryable() {
                    *guard = None;
                }
                mapped
            })?;
        let host = addr.rsplit_once(':').map_or(addr, |(h, _)| h);
        parse_cluster_slots(&value, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_urls_carry_credentials_and_scheme() {
        let mut config = RedisClusterConfig {
            password: Some("s3cret".into()),
            ..RedisClusterConfig::default()
        };
        let manager = ConnectionManager::new(&config);
        assert_eq!(manager.node_url("n1:7000"), "redis://:s3cret@n1:7000");

        config.use_tls = true;
        let manager = ConnectionManager::new(&config);
        assert_eq!(manager.node_url("n1:7000"), "rediss://:s3cret@n1:7000");
    }

    #[test]
    fn anonymous_urls_have_no_auth_section() {
        let manager = ConnectionManager::new(&RedisClusterConfig::default());
        assert_eq!(manager.node_url("n1:7000"), "redis://n1:7000");
    }

    #[tokio::test]
    async fn one_command_at_a_time_per_endpoint() {
        let manager = ConnectionManager::new(&RedisClusterConfig::default());

        let first = manager.slot("n1:7000");
        let second = manager.slot("n1:7000");
        assert!(Arc::ptr_eq(&first, &second), "one slot per endpoint");

        let _held = first.lock().await;
        assert!(
            second.try_lock().is_err(),
            "a held endpoint admits no second command"
        );
        assert!(
            manager.slot("n2:7000").try_lock().is_ok(),
            "other endpoints stay independent"
        );
    }
}
