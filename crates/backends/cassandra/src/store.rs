use std::time::Duration;

use async_trait::async_trait;
use scylla::transport::errors::{DbError, NewSessionError, QueryError};
use scylla::{QueryResult, Session, SessionBuilder};

use procstore_core::backend::KvBackend;
use procstore_core::error::StoreError;
use procstore_core::model::StoreId;

use crate::config::CassandraConfig;

/// Attempts before a contended counter compare-and-swap gives up.
const COUNTER_CAS_ATTEMPTS: u32 = 16;

fn map_session_err(e: &NewSessionError) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn map_query_err(e: &QueryError) -> StoreError {
    match e {
        QueryError::DbError(db, _) => match db {
            DbError::AuthenticationError | DbError::Unauthorized => {
                StoreError::Auth(e.to_string())
            }
            DbError::Unavailable { .. }
            | DbError::Overloaded
            | DbError::IsBootstrapping
            | DbError::ReadTimeout { .. }
            | DbError::WriteTimeout { .. } => StoreError::Connection(e.to_string()),
            _ => StoreError::Data(e.to_string()),
        },
        QueryError::TimeoutError
        | QueryError::UnableToAllocStreamId
        | QueryError::RequestTimeout(_) => StoreError::Connection(e.to_string()),
        _ => StoreError::Data(e.to_string()),
    }
}

/// `[applied]` column of a lightweight-transaction reply.
fn lwt_applied(result: QueryResult) -> Result<bool, StoreError> {
    let row = result
        .first_row()
        .map_err(|e| StoreError::Data(format!("conditional write returned no row: {e}")))?;
    row.columns
        .first()
        .and_then(Option::as_ref)
        .and_then(scylla::frame::response::result::CqlValue::as_boolean)
        .ok_or_else(|| StoreError::Data("conditional write reply lacks [applied]".into()))
}

/// Partition key for a store. Ids come from a counter starting at one,
/// so they fit a CQL bigint.
fn store_pk(store: StoreId) -> i64 {
    i64::try_from(store.value()).unwrap_or(i64::MAX)
}

/// CQL TTL argument; zero means no expiry.
fn ttl_arg(ttl: Option<Duration>) -> i32 {
    ttl.map_or(0, |d| i32::try_from(d.as_secs().max(1)).unwrap_or(i32::MAX))
}

/// Cassandra implementation of [`KvBackend`].
pub struct CassandraBackend {
    session: Session,
    keyspace: String,
}

impl CassandraBackend {
    /// Connect to the cluster and create the keyspace and tables if they
    /// do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if no contact point answers and
    /// [`StoreError::Auth`] on rejected credentials.
    pub async fn connect(config: &CassandraConfig) -> Result<Self, StoreError> {
        let mut builder = SessionBuilder::new()
            .known_nodes(&config.nodes)
            .connection_timeout(config.connect_timeout);
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.user(user, password);
        }
        let session = builder.build().await.map_err(|e| map_session_err(&e))?;

        let backend = Self {
            session,
            keyspace: config.keyspace.clone(),
        };
        backend.create_schema(config.replication_factor).await?;
        tracing::debug!(keyspace = %backend.keyspace, "cassandra schema ready");
        Ok(backend)
    }

    async fn create_schema(&self, replication_factor: u32) -> Result<(), StoreError> {
        let ks = &self.keyspace;
        let statements = [
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {ks} WITH replication = \
                 {{'class': 'SimpleStrategy', 'replication_factor': {replication_factor}}}"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {ks}.entries \
                 (store bigint, key blob, value blob, PRIMARY KEY (store, key))"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {ks}.ttl_entries \
                 (key blob PRIMARY KEY, value blob)"
            ),
            format!("CREATE TABLE IF NOT EXISTS {ks}.meta (key text PRIMARY KEY, value text)"),
        ];
        for stmt in statements {
            self.session
                .query_unpaged(stmt, ())
                .await
                .map_err(|e| map_query_err(&e))?;
        }
        Ok(())
    }

    async fn run(
        &self,
        cql: String,
        values: impl scylla::serialize::row::SerializeRow,
    ) -> Result<QueryResult, StoreError> {
        self.session
            .query_unpaged(cql, values)
            .await
            .map_err(|e| map_query_err(&e))
    }
}

#[async_trait]
impl KvBackend for CassandraBackend {
    fn product_name(&self) -> &'static str {
        "cassandra"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!(
                    "INSERT INTO {ks}.entries (store, key, value) VALUES (?, ?, ?) IF NOT EXISTS"
                ),
                (store_pk(store), key, value),
            )
            .await?;
        if lwt_applied(result)? {
            return Ok(true);
        }
        // Key already present; plain upsert overwrites it.
        self.run(
            format!("INSERT INTO {ks}.entries (store, key, value) VALUES (?, ?, ?)"),
            (store_pk(store), key, value),
        )
        .await?;
        Ok(false)
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("SELECT value FROM {ks}.entries WHERE store = ? AND key = ?"),
                (store_pk(store), key),
            )
            .await?;
        let row = result
            .maybe_first_row_typed::<(Vec<u8>,)>()
            .map_err(|e| StoreError::Data(format!("unexpected entries row: {e}")))?;
        Ok(row.map(|(value,)| value))
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("DELETE FROM {ks}.entries WHERE store = ? AND key = ? IF EXISTS"),
                (store_pk(store), key),
            )
            .await?;
        lwt_applied(result)
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("SELECT key FROM {ks}.entries WHERE store = ? AND key = ?"),
                (store_pk(store), key),
            )
            .await?;
        let row = result
            .maybe_first_row_typed::<(Vec<u8>,)>()
            .map_err(|e| StoreError::Data(format!("unexpected entries row: {e}")))?;
        Ok(row.is_some())
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        let ks = &self.keyspace;
        // Partition delete; every entry of the store in one statement.
        self.run(
            format!("DELETE FROM {ks}.entries WHERE store = ?"),
            (store_pk(store),),
        )
        .await?;
        Ok(())
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("SELECT COUNT(*) FROM {ks}.entries WHERE store = ?"),
                (store_pk(store),),
            )
            .await?;
        let (count,) = result
            .first_row_typed::<(i64,)>()
            .map_err(|e| StoreError::Data(format!("unexpected count row: {e}")))?;
        u64::try_from(count).map_err(|_| StoreError::Data("negative partition count".into()))
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let ks = &self.keyspace;
        self.run(
            format!("INSERT INTO {ks}.ttl_entries (key, value) VALUES (?, ?) USING TTL ?"),
            (key, value, ttl_arg(Some(ttl))),
        )
        .await?;
        Ok(())
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("SELECT value FROM {ks}.ttl_entries WHERE key = ?"),
                (key,),
            )
            .await?;
        let row = result
            .maybe_first_row_typed::<(Vec<u8>,)>()
            .map_err(|e| StoreError::Data(format!("unexpected ttl_entries row: {e}")))?;
        Ok(row.map(|(value,)| value))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("DELETE FROM {ks}.ttl_entries WHERE key = ? IF EXISTS"),
                (key,),
            )
            .await?;
        lwt_applied(result)
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn meta_check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!(
                    "INSERT INTO {ks}.meta (key, value) VALUES (?, ?) IF NOT EXISTS USING TTL ?"
                ),
                (key, value, ttl_arg(ttl)),
            )
            .await?;
        lwt_applied(result)
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(format!("SELECT value FROM {ks}.meta WHERE key = ?"), (key,))
            .await?;
        let row = result
            .maybe_first_row_typed::<(String,)>()
            .map_err(|e| StoreError::Data(format!("unexpected meta row: {e}")))?;
        Ok(row.map(|(value,)| value))
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let ks = &self.keyspace;
        self.run(
            format!("INSERT INTO {ks}.meta (key, value) VALUES (?, ?) USING TTL ?"),
            (key, value, ttl_arg(ttl)),
        )
        .await?;
        Ok(())
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("DELETE FROM {ks}.meta WHERE key = ? IF EXISTS"),
                (key,),
            )
            .await?;
        lwt_applied(result)
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let ks = &self.keyspace;
        let result = self
            .run(
                format!("DELETE FROM {ks}.meta WHERE key = ? IF value = ?"),
                (key, expected),
            )
            .await?;
        lwt_applied(result)
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        let ks = &self.keyspace;

        // Seed the counter, then compare-and-swap until our increment
        // lands. Counter columns are no use here because they cannot be
        // read back in the same atomic step.
        self.run(
            format!("INSERT INTO {ks}.meta (key, value) VALUES (?, '0') IF NOT EXISTS"),
            (key,),
        )
        .await?;

        for _ in 0..COUNTER_CAS_ATTEMPTS {
            let current = self
                .meta_get(key)
                .await?
                .ok_or_else(|| StoreError::Data(format!("counter {key:?} vanished")))?;
            let current_n: u64 = current
                .parse()
                .map_err(|e| StoreError::Data(format!("corrupt counter {key:?}: {e}")))?;
            let next = (current_n + 1).to_string();

            let result = self
                .run(
                    format!("UPDATE {ks}.meta SET value = ? WHERE key = ? IF value = ?"),
                    (next.as_str(), key, current.as_str()),
                )
                .await?;
            if lwt_applied(result)? {
                return Ok(current_n + 1);
            }
        }
        tracing::warn!(key, attempts = COUNTER_CAS_ATTEMPTS, "counter stayed contended");
        Err(StoreError::Data(format!(
            "counter {key:?} stayed contended for {COUNTER_CAS_ATTEMPTS} attempts"
        )))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run("SELECT release_version FROM system.local".to_owned(), ())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_argument_mapping() {
        assert_eq!(ttl_arg(None), 0);
        assert_eq!(ttl_arg(Some(Duration::from_millis(10))), 1);
        assert_eq!(ttl_arg(Some(Duration::from_secs(3600))), 3600);
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use procstore_core::testing::run_backend_conformance;

    fn test_config() -> CassandraConfig {
        CassandraConfig {
            nodes: vec![
                std::env::var("CASSANDRA_NODE").unwrap_or_else(|_| "127.0.0.1:9042".to_string())
            ],
            keyspace: format!("pt_{}", uuid::Uuid::new_v4().simple()),
            ..CassandraConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let backend = CassandraBackend::connect(&test_config())
            .await
            .expect("cluster should be reachable");
        run_backend_conformance(&backend)
            .await
            .expect("conformance suite should pass");
    }
}
