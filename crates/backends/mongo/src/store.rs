use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};

use procstore_core::backend::KvBackend;
use procstore_core::error::StoreError;
use procstore_core::model::StoreId;

use crate::config::MongoConfig;

/// Entries this close to their deadline count as already expired, which
/// absorbs small clock differences between client and server.
const SKEW_TOLERANCE: Duration = Duration::from_secs(1);

fn map_mongo_err(e: &mongodb::error::Error) -> StoreError {
    match &*e.kind {
        ErrorKind::Authentication { .. } => StoreError::Auth(e.to_string()),
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => StoreError::Connection(e.to_string()),
        _ => StoreError::Data(e.to_string()),
    }
}

fn is_dup_key(e: &mongodb::error::Error) -> bool {
    matches!(&*e.kind, ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11_000)
}

fn bin(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

/// Deadline for a record written now with the given TTL.
fn deadline(ttl: Duration) -> DateTime {
    let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    DateTime::from_millis(DateTime::now().timestamp_millis().saturating_add(ms))
}

/// Cutoff below which a record counts as expired on read.
fn live_cutoff() -> DateTime {
    let ms = i64::try_from(SKEW_TOLERANCE.as_millis()).unwrap_or(i64::MAX);
    DateTime::from_millis(DateTime::now().timestamp_millis().saturating_add(ms))
}

/// `$or` clause matching records that are not expired: either no
/// deadline at all or one still in the future.
fn live_clause() -> Bson {
    Bson::Array(vec![
        Bson::Document(doc! { "expires_at": { "$exists": false } }),
        Bson::Document(doc! { "expires_at": { "$gt": live_cutoff() } }),
    ])
}

/// MongoDB implementation of [`KvBackend`].
pub struct MongoBackend {
    entries: Collection<Document>,
    ttl_entries: Collection<Document>,
    meta: Collection<Document>,
    db: mongodb::Database,
}

impl MongoBackend {
    /// Connect and make sure the TTL indexes exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for an unparsable URI and
    /// [`StoreError::Connection`] when no server can be selected.
    pub async fn connect(config: &MongoConfig) -> Result<Self, StoreError> {
        let mut opts = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| StoreError::Configuration(format!("bad mongodb uri: {e}")))?;
        opts.connect_timeout = Some(config.connect_timeout);
        opts.server_selection_timeout = Some(config.connect_timeout);

        let client = Client::with_options(opts).map_err(|e| map_mongo_err(&e))?;
        let db = client.database(&config.database);
        let backend = Self {
            entries: db.collection("entries"),
            ttl_entries: db.collection("ttl_entries"),
            meta: db.collection("meta"),
            db,
        };

        // The TTL monitor garbage-collects expired records; reads never
        // rely on it having run.
        let ttl_index = IndexModel::builder()
            .keys(doc! { "expires_at": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::from_secs(0))
                    .build(),
            )
            .build();
        backend
            .ttl_entries
            .create_index(ttl_index.clone())
            .await
            .map_err(|e| map_mongo_err(&e))?;
        backend
            .meta
            .create_index(ttl_index)
            .await
            .map_err(|e| map_mongo_err(&e))?;

        tracing::debug!(database = %config.database, "mongo ttl indexes ready");
        Ok(backend)
    }

    fn entry_id(store: StoreId, key: &[u8]) -> Bson {
        // Compound _id; the server's unique index on _id is the
        // conditional-write primitive.
        Bson::Document(doc! { "s": store_pk(store), "k": bin(key) })
    }
}

/// Store id as a BSON long. Ids come from a counter starting at one.
fn store_pk(store: StoreId) -> i64 {
    i64::try_from(store.value()).unwrap_or(i64::MAX)
}

#[async_trait]
impl KvBackend for MongoBackend {
    fn product_name(&self) -> &'static str {
        "mongo"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let result = self
            .entries
            .replace_one(
                doc! { "_id": Self::entry_id(store, key) },
                doc! { "v": bin(value) },
            )
            .upsert(true)
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(result.upserted_id.is_some())
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let found = self
            .entries
            .find_one(doc! { "_id": Self::entry_id(store, key) })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        match found {
            Some(doc) => {
                let value = doc
                    .get_binary_generic("v")
                    .map_err(|e| StoreError::Data(format!("corrupt entry document: {e}")))?;
                Ok(Some(value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let result = self
            .entries
            .delete_one(doc! { "_id": Self::entry_id(store, key) })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(result.deleted_count == 1)
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let found = self
            .entries
            .find_one(doc! { "_id": Self::entry_id(store, key) })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(found.is_some())
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        self.entries
            .delete_many(doc! { "_id.s": store_pk(store) })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(())
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        self.entries
            .count_documents(doc! { "_id.s": store_pk(store) })
            .await
            .map_err(|e| map_mongo_err(&e))
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.ttl_entries
            .replace_one(
                doc! { "_id": bin(key) },
                doc! { "v": bin(value), "expires_at": deadline(ttl) },
            )
            .upsert(true)
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(())
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let found = self
            .ttl_entries
            .find_one(doc! { "_id": bin(key), "expires_at": { "$gt": live_cutoff() } })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        match found {
            Some(doc) => {
                let value = doc
                    .get_binary_generic("v")
                    .map_err(|e| StoreError::Data(format!("corrupt ttl document: {e}")))?;
                Ok(Some(value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let removed = self
            .ttl_entries
            .find_one_and_delete(doc! { "_id": bin(key) })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        // Deleting an already-expired leftover does not count.
        Ok(removed.is_some_and(|doc| {
            doc.get_datetime("expires_at")
                .is_ok_and(|at| *at > live_cutoff())
        }))
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let found = self
            .ttl_entries
            .find_one(doc! { "_id": bin(key), "expires_at": { "$gt": live_cutoff() } })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(found.is_some())
    }

    async fn meta_check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        // An expired record the TTL monitor has not swept yet must not
        // block the claim.
        self.meta
            .delete_one(doc! { "_id": key, "expires_at": { "$lte": live_cutoff() } })
            .await
            .map_err(|e| map_mongo_err(&e))?;

        let mut record = doc! { "_id": key, "v": value };
        if let Some(ttl) = ttl {
            record.insert("expires_at", deadline(ttl));
        }
        match self.meta.insert_one(record).await {
            Ok(_) => Ok(true),
            Err(e) if is_dup_key(&e) => Ok(false),
            Err(e) => Err(map_mongo_err(&e)),
        }
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let found = self
            .meta
            .find_one(doc! { "_id": key, "$or": live_clause() })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        match found {
            Some(doc) => {
                let value = doc
                    .get_str("v")
                    .map_err(|e| StoreError::Data(format!("corrupt meta document: {e}")))?;
                Ok(Some(value.to_owned()))
            }
            None => Ok(None),
        }
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut record = doc! { "v": value };
        if let Some(ttl) = ttl {
            record.insert("expires_at", deadline(ttl));
        }
        self.meta
            .replace_one(doc! { "_id": key }, record)
            .upsert(true)
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(())
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .meta
            .find_one_and_delete(doc! { "_id": key })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(removed.is_some_and(|doc| match doc.get_datetime("expires_at") {
            Ok(at) => *at > live_cutoff(),
            Err(_) => true,
        }))
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let removed = self
            .meta
            .find_one_and_delete(doc! { "_id": key, "v": expected, "$or": live_clause() })
            .await
            .map_err(|e| map_mongo_err(&e))?;
        Ok(removed.is_some())
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        let updated = self
            .meta
            .find_one_and_update(doc! { "_id": key }, doc! { "$inc": { "n": 1_i64 } })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| map_mongo_err(&e))?
            .ok_or_else(|| StoreError::Data(format!("counter {key:?} upsert returned nothing")))?;
        let value = updated
            .get_i64("n")
            .map_err(|e| StoreError::Data(format!("corrupt counter {key:?}: {e}")))?;
        u64::try_from(value)
            .map_err(|_| StoreError::Data(format!("counter {key:?} went negative")))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| map_mongo_err(&e))
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use procstore_core::testing::run_backend_conformance;

    fn test_config() -> MongoConfig {
        MongoConfig {
            uri: std::env::var("MONGODB_URI")
                .unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string()),
            database: format!("pt_{}", uuid::Uuid::new_v4().simple()),
            ..MongoConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let backend = MongoBackend::connect(&test_config())
            .await
            .expect("server should be reachable");
        run_backend_conformance(&backend)
            .await
            .expect("conformance suite should pass");
    }
}
