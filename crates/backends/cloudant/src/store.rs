use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use procstore_core::backend::KvBackend;
use procstore_core::error::StoreError;
use procstore_core::keys::render_binary;
use procstore_core::model::StoreId;

use crate::config::CloudantConfig;

/// Records this close to their deadline count as already expired.
const SKEW_TOLERANCE_SECS: i64 = 1;

/// Revision-conflict retries before an update reports contention.
const WRITE_ATTEMPTS: u32 = 8;

/// Shape of every document this adapter writes. Entry and TTL values are
/// base64 in `v`; meta values are the plain string.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDoc {
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
    v: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

#[derive(Deserialize)]
struct AllDocsReply {
    rows: Vec<AllDocsRow>,
}

#[derive(Deserialize)]
struct AllDocsRow {
    id: String,
    value: AllDocsRev,
}

#[derive(Deserialize)]
struct AllDocsRev {
    rev: String,
}

enum PutOutcome {
    Stored,
    Conflict,
}

fn map_http_err(e: &reqwest::Error) -> StoreError {
    if e.is_timeout() || e.is_connect() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Data(e.to_string())
    }
}

fn unexpected_status(op: &str, status: StatusCode) -> StoreError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StoreError::Auth(format!("{op}: {status}"))
    } else {
        StoreError::Data(format!("{op}: unexpected status {status}"))
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// TTL entries vanish a little early so a reader with a lagging clock
/// never sees one past its deadline.
fn ttl_live(doc: &StoredDoc) -> bool {
    doc.expires_at
        .map_or(true, |at| at > now_epoch() + SKEW_TOLERANCE_SECS)
}

/// Meta entries carry lock claims; expiring those early would admit a
/// second owner inside the lease, so they live until the deadline itself.
fn meta_live(doc: &StoredDoc) -> bool {
    doc.expires_at.map_or(true, |at| at > now_epoch())
}

fn expiry_in(ttl: Duration) -> i64 {
    now_epoch().saturating_add(i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX))
}

/// Cloudant implementation of [`KvBackend`].
pub struct CloudantBackend {
    http: reqwest::Client,
    base: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl CloudantBackend {
    /// Connect to the service, creating the database if it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] when the service is
    /// unreachable and [`StoreError::Auth`] on rejected credentials.
    pub async fn connect(config: &CloudantConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Configuration(e.to_string()))?;

        let backend = Self {
            http,
            base: config.base_url.clone(),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };

        let status = backend
            .req(Method::PUT, &backend.database.clone())
            .send()
            .await
            .map_err(|e| map_http_err(&e))?
            .status();
        match status {
            StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::PRECONDITION_FAILED => {
                tracing::debug!(database = %backend.database, "cloudant database ready");
                Ok(backend)
            }
            s => Err(unexpected_status("create database", s)),
        }
    }

    fn req(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.http.request(method, format!("{}/{path}", self.base));
        if let Some(user) = &self.username {
            rb = rb.basic_auth(user, self.password.as_deref());
        }
        rb
    }

    fn doc_path(&self, id: &str) -> String {
        format!("{}/{id}", self.database)
    }

    fn entry_id(&self, store: StoreId, key: &[u8]) -> String {
        format!("s:{store}:{}", render_binary(key))
    }

    fn ttl_id(key: &[u8]) -> String {
        format!("t:{}", render_binary(key))
    }

    fn meta_id(key: &str) -> String {
        format!("m:{key}")
    }

    async fn get_doc(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let resp = self
            .req(Method::GET, &self.doc_path(id))
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        match resp.status() {
            StatusCode::OK => {
                let doc = resp
                    .json::<StoredDoc>()
                    .await
                    .map_err(|e| StoreError::Data(format!("corrupt document {id:?}: {e}")))?;
                Ok(Some(doc))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(unexpected_status("fetch document", s)),
        }
    }

    /// `PUT` the document; a missing `rev` makes this set-if-absent.
    async fn put_doc(&self, id: &str, doc: &StoredDoc) -> Result<PutOutcome, StoreError> {
        let resp = self
            .req(Method::PUT, &self.doc_path(id))
            .json(doc)
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => Ok(PutOutcome::Stored),
            StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
            s => Err(unexpected_status("store document", s)),
        }
    }

    /// Delete pinned to `rev`; `false` means the document moved on (or is
    /// already gone), which is the fence.
    async fn delete_doc(&self, id: &str, rev: &str) -> Result<bool, StoreError> {
        let resp = self
            .req(Method::DELETE, &self.doc_path(id))
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        match resp.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(true),
            StatusCode::CONFLICT | StatusCode::NOT_FOUND => Ok(false),
            s => Err(unexpected_status("delete document", s)),
        }
    }

    /// Write-wins upsert. Returns `true` when the document did not exist
    /// before.
    async fn upsert(&self, id: &str, v: String, expires_at: Option<i64>) -> Result<bool, StoreError> {
        for _ in 0..WRITE_ATTEMPTS {
            let rev = self.get_doc(id).await?.and_then(|d| d.rev);
            let was_absent = rev.is_none();
            let doc = StoredDoc {
                rev,
                v: v.clone(),
                expires_at,
            };
            if let PutOutcome::Stored = self.put_doc(id, &doc).await? {
                return Ok(was_absent);
            }
        }
        Err(StoreError::Data(format!(
            "document {id:?} stayed contended for {WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Delete whatever revision is current. Returns `true` if a document
    /// was removed.
    async fn force_delete(&self, id: &str) -> Result<bool, StoreError> {
        for _ in 0..WRITE_ATTEMPTS {
            let Some(doc) = self.get_doc(id).await? else {
                return Ok(false);
            };
            let Some(rev) = doc.rev else {
                return Err(StoreError::Data(format!("document {id:?} has no revision")));
            };
            if self.delete_doc(id, &rev).await? {
                return Ok(true);
            }
        }
        Err(StoreError::Data(format!(
            "document {id:?} stayed contended for {WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Ids and revisions of every document whose id starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let resp = self
            .req(Method::GET, &format!("{}/_all_docs", self.database))
            .query(&[
                ("startkey", format!("\"{prefix}\"")),
                ("endkey", format!("\"{prefix}\u{fff0}\"")),
            ])
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        if !resp.status().is_success() {
            return Err(unexpected_status("scan documents", resp.status()));
        }
        let reply = resp
            .json::<AllDocsReply>()
            .await
            .map_err(|e| StoreError::Data(format!("corrupt _all_docs reply: {e}")))?;
        Ok(reply
            .rows
            .into_iter()
            .map(|row| (row.id, row.value.rev))
            .collect())
    }
}

#[async_trait]
impl KvBackend for CloudantBackend {
    fn product_name(&self) -> &'static str {
        "cloudant"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        self.upsert(&self.entry_id(store, key), STANDARD.encode(value), None)
            .await
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let id = self.entry_id(store, key);
        match self.get_doc(&id).await? {
            Some(doc) => {
                let value = STANDARD
                    .decode(&doc.v)
                    .map_err(|e| StoreError::Data(format!("corrupt entry {id:?}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        self.force_delete(&self.entry_id(store, key)).await
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get_doc(&self.entry_id(store, key)).await?.is_some())
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        let rows = self.scan_prefix(&format!("s:{store}:")).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let stubs: Vec<_> = rows
            .into_iter()
            .map(|(id, rev)| json!({ "_id": id, "_rev": rev, "_deleted": true }))
            .collect();
        let resp = self
            .req(Method::POST, &format!("{}/_bulk_docs", self.database))
            .json(&json!({ "docs": stubs }))
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        if !resp.status().is_success() {
            return Err(unexpected_status("bulk delete", resp.status()));
        }
        Ok(())
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        let rows = self.scan_prefix(&format!("s:{store}:")).await?;
        u64::try_from(rows.len()).map_err(|_| StoreError::Data("store too large to count".into()))
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.upsert(
            &Self::ttl_id(key),
            STANDARD.encode(value),
            Some(expiry_in(ttl)),
        )
        .await
        .map(|_| ())
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let id = Self::ttl_id(key);
        let Some(doc) = self.get_doc(&id).await? else {
            return Ok(None);
        };
        if !ttl_live(&doc) {
            // Lazy sweep of the expired leftover.
            if let Some(rev) = doc.rev {
                let _ = self.delete_doc(&id, &rev).await;
            }
            return Ok(None);
        }
        let value = STANDARD
            .decode(&doc.v)
            .map_err(|e| StoreError::Data(format!("corrupt ttl entry {id:?}: {e}")))?;
        Ok(Some(value))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let id = Self::ttl_id(key);
        let Some(doc) = self.get_doc(&id).await? else {
            return Ok(false);
        };
        let live = ttl_live(&doc);
        if let Some(rev) = doc.rev {
            let _ = self.delete_doc(&id, &rev).await?;
        }
        Ok(live)
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
        let id = Self::meta_id(key);
        for _ in 0..WRITE_ATTEMPTS {
            match self.get_doc(&id).await? {
                None => {
                    let doc = StoredDoc {
                        rev: None,
                        v: value.to_owned(),
                        expires_at: ttl.map(expiry_in),
                    };
                    return match self.put_doc(&id, &doc).await? {
                        PutOutcome::Stored => Ok(true),
                        // Someone else landed first.
                        PutOutcome::Conflict => Ok(false),
                    };
                }
                Some(doc) if meta_live(&doc) => return Ok(false),
                Some(doc) => {
                    // Expired leftover; clear it and retry the claim.
                    if let Some(rev) = doc.rev {
                        let _ = self.delete_doc(&id, &rev).await?;
                    }
                }
            }
        }
        Err(StoreError::Data(format!(
            "document {id:?} stayed contended for {WRITE_ATTEMPTS} attempts"
        )))
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let doc = self.get_doc(&Self::meta_id(key)).await?;
        Ok(doc.filter(meta_live).map(|d| d.v))
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.upsert(&Self::meta_id(key), value.to_owned(), ttl.map(expiry_in))
            .await
            .map(|_| ())
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        let id = Self::meta_id(key);
        let Some(doc) = self.get_doc(&id).await? else {
            return Ok(false);
        };
        let live = meta_live(&doc);
        if let Some(rev) = doc.rev {
            let _ = self.delete_doc(&id, &rev).await?;
        }
        Ok(live)
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let id = Self::meta_id(key);
        let Some(doc) = self.get_doc(&id).await? else {
            return Ok(false);
        };
        if !meta_live(&doc) || doc.v != expected {
            return Ok(false);
        }
        let Some(rev) = doc.rev else {
            return Err(StoreError::Data(format!("document {id:?} has no revision")));
        };
        // Pinned to the revision we compared; a concurrent change makes
        // this a clean miss rather than a stolen delete.
        self.delete_doc(&id, &rev).await
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        let id = Self::meta_id(key);
        for _ in 0..WRITE_ATTEMPTS {
            match self.get_doc(&id).await? {
                None => {
                    let doc = StoredDoc {
                        rev: None,
                        v: String::from("1"),
                        expires_at: None,
                    };
                    if let PutOutcome::Stored = self.put_doc(&id, &doc).await? {
                        return Ok(1);
                    }
                }
                Some(doc) => {
                    let current: u64 = doc
                        .v
                        .parse()
                        .map_err(|e| StoreError::Data(format!("corrupt counter {id:?}: {e}")))?;
                    let next = StoredDoc {
                        rev: doc.rev,
                        v: (current + 1).to_string(),
                        expires_at: None,
                    };
                    if let PutOutcome::Stored = self.put_doc(&id, &next).await? {
                        return Ok(current + 1);
                    }
                }
            }
        }
        Err(StoreError::Data(format!(
            "counter {id:?} stayed contended for {WRITE_ATTEMPTS} attempts"
        )))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let resp = self
            .req(Method::GET, "")
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(unexpected_status("ping", resp.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_liveness_uses_skew_tolerance() {
        let live = StoredDoc {
            rev: None,
            v: String::new(),
            expires_at: Some(now_epoch() + 60),
        };
        let near_deadline = StoredDoc {
            rev: None,
            v: String::new(),
            expires_at: Some(now_epoch() + SKEW_TOLERANCE_SECS),
        };
        let eternal = StoredDoc {
            rev: None,
            v: String::new(),
            expires_at: None,
        };
        assert!(ttl_live(&live));
        assert!(!ttl_live(&near_deadline));
        assert!(ttl_live(&eternal));
    }

    #[test]
    fn meta_liveness_runs_to_the_deadline() {
        // A short lease must stay claimed for its whole duration; only
        // TTL entries expire early.
        let near_deadline = StoredDoc {
            rev: None,
            v: String::new(),
            expires_at: Some(now_epoch() + SKEW_TOLERANCE_SECS),
        };
        let past_deadline = StoredDoc {
            rev: None,
            v: String::new(),
            expires_at: Some(now_epoch() - 1),
        };
        assert!(meta_live(&near_deadline));
        assert!(!meta_live(&past_deadline));
    }

    #[test]
    fn documents_serialize_without_empty_fields() {
        let doc = StoredDoc {
            rev: None,
            v: String::from("x"),
            expires_at: None,
        };
        assert_eq!(serde_json::to_string(&doc).unwrap(), r#"{"v":"x"}"#);
    }
}
