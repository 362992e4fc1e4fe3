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

use crate::config::HbaseConfig;

/// Column family holding every cell.
const FAMILY: &str = "d";
/// The single qualifier records are stored under.
const COLUMN: &str = "d:v";
/// Records this close to their deadline count as already expired.
const SKEW_TOLERANCE_SECS: i64 = 1;
/// Rows fetched per scanner round trip.
const SCAN_BATCH: u32 = 1000;

/// JSON stored in TTL and meta cells. Entry cells hold the raw value
/// bytes directly.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDoc {
    v: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

#[derive(Deserialize)]
struct CellSet {
    #[serde(rename = "Row", default)]
    rows: Vec<RestRow>,
}

#[derive(Deserialize)]
struct RestRow {
    key: String,
    #[serde(rename = "Cell", default)]
    cells: Vec<RestCell>,
}

#[derive(Deserialize)]
struct RestCell {
    #[serde(rename = "$")]
    value: String,
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

/// HBase REST implementation of [`KvBackend`]. See the crate docs for
/// the atomicity caveats of this transport.
pub struct HbaseBackend {
    http: reqwest::Client,
    base: String,
    table: String,
    username: Option<String>,
    password: Option<String>,
}

impl HbaseBackend {
    /// Connect to the gateway, creating the table if it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] when the gateway is
    /// unreachable and [`StoreError::Auth`] on rejected credentials.
    pub async fn connect(config: &HbaseConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Configuration(e.to_string()))?;

        let backend = Self {
            http,
            base: config.base_url.clone(),
            table: config.table.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };

        let schema = json!({
            "name": backend.table,
            "ColumnSchema": [{ "name": FAMILY }],
        });
        let status = backend
            .req(Method::PUT, &format!("{}/schema", backend.table))
            .json(&schema)
            .send()
            .await
            .map_err(|e| map_http_err(&e))?
            .status();
        if !status.is_success() {
            return Err(unexpected_status("create table", status));
        }
        Ok(backend)
    }

    fn req(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .http
            .request(method, format!("{}/{path}", self.base))
            .header("Accept", "application/json");
        if let Some(user) = &self.username {
            rb = rb.basic_auth(user, self.password.as_deref());
        }
        rb
    }

    fn entry_row(store: StoreId, key: &[u8]) -> String {
        format!("s:{store}:{}", render_binary(key))
    }

    fn ttl_row(key: &[u8]) -> String {
        format!("t:{}", render_binary(key))
    }

    fn meta_row(key: &str) -> String {
        format!("m:{key}")
    }

    /// Raw bytes of the record cell, if the row exists.
    async fn read_cell(&self, row: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let resp = self
            .req(Method::GET, &format!("{}/{row}/{COLUMN}", self.table))
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        match resp.status() {
            StatusCode::OK => {
                let cells = resp
                    .json::<CellSet>()
                    .await
                    .map_err(|e| StoreError::Data(format!("corrupt cell reply: {e}")))?;
                let encoded = cells
                    .rows
                    .first()
                    .and_then(|r| r.cells.first())
                    .map(|c| c.value.clone())
                    .ok_or_else(|| StoreError::Data(format!("row {row:?} reply has no cell")))?;
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|e| StoreError::Data(format!("corrupt cell in {row:?}: {e}")))?;
                Ok(Some(bytes))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(unexpected_status("read cell", s)),
        }
    }

    async fn write_cell(&self, row: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let body = json!({
            "Row": [{
                "key": STANDARD.encode(row),
                "Cell": [{
                    "column": STANDARD.encode(COLUMN),
                    "$": STANDARD.encode(bytes),
                }],
            }],
        });
        let status = self
            .req(Method::PUT, &format!("{}/{row}/{COLUMN}", self.table))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_http_err(&e))?
            .status();
        if status.is_success() {
            Ok(())
        } else {
            Err(unexpected_status("write cell", status))
        }
    }

    /// Delete a whole row. The gateway answers 200 whether or not the
    /// row existed, so callers needing a flag check first.
    async fn delete_row(&self, row: &str) -> Result<(), StoreError> {
        let status = self
            .req(Method::DELETE, &format!("{}/{row}", self.table))
            .send()
            .await
            .map_err(|e| map_http_err(&e))?
            .status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(unexpected_status("delete row", status))
        }
    }

    /// Row keys of every row whose key starts with `prefix`, via the
    /// gateway's stateful scanner resource.
    async fn scan_rows(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut end = prefix.as_bytes().to_vec();
        end.push(0xFF);
        let body = json!({
            "batch": SCAN_BATCH,
            "startRow": STANDARD.encode(prefix),
            "endRow": STANDARD.encode(end),
        });

        let resp = self
            .req(Method::POST, &format!("{}/scanner", self.table))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_http_err(&e))?;
        if resp.status() != StatusCode::CREATED {
            return Err(unexpected_status("open scanner", resp.status()));
        }
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| StoreError::Data("scanner reply lacks a location".into()))?;

        let mut rows = Vec::new();
        let result = self.drain_scanner(&location, &mut rows).await;

        // Scanners are server-side state; release even after a failure.
        let mut rb = self
            .http
            .request(Method::DELETE, &location)
            .header("Accept", "application/json");
        if let Some(user) = &self.username {
            rb = rb.basic_auth(user, self.password.as_deref());
        }
        if let Err(e) = rb.send().await {
            tracing::warn!(error = %e, "scanner release failed");
        }

        result.map(|()| rows)
    }

    async fn drain_scanner(
        &self,
        location: &str,
        rows: &mut Vec<String>,
    ) -> Result<(), StoreError> {
        loop {
            let mut rb = self
                .http
                .request(Method::GET, location)
                .header("Accept", "application/json");
            if let Some(user) = &self.username {
                rb = rb.basic_auth(user, self.password.as_deref());
            }
            let resp = rb.send().await.map_err(|e| map_http_err(&e))?;
            match resp.status() {
                StatusCode::OK => {
                    let cells = resp
                        .json::<CellSet>()
                        .await
                        .map_err(|e| StoreError::Data(format!("corrupt scanner reply: {e}")))?;
                    for row in cells.rows {
                        let key = STANDARD
                            .decode(&row.key)
                            .ok()
                            .and_then(|b| String::from_utf8(b).ok())
                            .ok_or_else(|| {
                                StoreError::Data(format!("undecodable row key {:?}", row.key))
                            })?;
                        rows.push(key);
                    }
                }
                StatusCode::NO_CONTENT => return Ok(()),
                s => return Err(unexpected_status("advance scanner", s)),
            }
        }
    }

    async fn read_doc(&self, row: &str) -> Result<Option<StoredDoc>, StoreError> {
        match self.read_cell(row).await? {
            Some(bytes) => {
                let doc = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Data(format!("corrupt record in {row:?}: {e}")))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    async fn write_doc(&self, row: &str, doc: &StoredDoc) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(doc)
            .map_err(|e| StoreError::Data(format!("record encoding failed: {e}")))?;
        self.write_cell(row, &bytes).await
    }
}

#[async_trait]
impl KvBackend for HbaseBackend {
    fn product_name(&self) -> &'static str {
        "hbase"
    }

    async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let row = Self::entry_row(store, key);
        let existed = self.read_cell(&row).await?.is_some();
        self.write_cell(&row, value).await?;
        Ok(!existed)
    }

    async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_cell(&Self::entry_row(store, key)).await
    }

    async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        let row = Self::entry_row(store, key);
        if self.read_cell(&row).await?.is_none() {
            return Ok(false);
        }
        self.delete_row(&row).await?;
        Ok(true)
    }

    async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.read_cell(&Self::entry_row(store, key)).await?.is_some())
    }

    async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
        for row in self.scan_rows(&format!("s:{store}:")).await? {
            self.delete_row(&row).await?;
        }
        Ok(())
    }

    async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
        let rows = self.scan_rows(&format!("s:{store}:")).await?;
        u64::try_from(rows.len()).map_err(|_| StoreError::Data("store too large to count".into()))
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let doc = StoredDoc {
            v: STANDARD.encode(value),
            expires_at: Some(expiry_in(ttl)),
        };
        self.write_doc(&Self::ttl_row(key), &doc).await
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let row = Self::ttl_row(key);
        let Some(doc) = self.read_doc(&row).await? else {
            return Ok(None);
        };
        if !ttl_live(&doc) {
            // Lazy sweep of the expired leftover.
            self.delete_row(&row).await?;
            return Ok(None);
        }
        let value = STANDARD
            .decode(&doc.v)
            .map_err(|e| StoreError::Data(format!("corrupt ttl record {row:?}: {e}")))?;
        Ok(Some(value))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
        let row = Self::ttl_row(key);
        let Some(doc) = self.read_doc(&row).await? else {
            return Ok(false);
        };
        self.delete_row(&row).await?;
        Ok(ttl_live(&doc))
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
        let row = Self::meta_row(key);
        match self.read_doc(&row).await? {
            Some(doc) if meta_live(&doc) => return Ok(false),
            Some(_) => self.delete_row(&row).await?,
            None => {}
        }
        // Read-then-write; see the crate docs for the race caveat.
        let doc = StoredDoc {
            v: value.to_owned(),
            expires_at: ttl.map(expiry_in),
        };
        self.write_doc(&row, &doc).await?;
        Ok(true)
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let doc = self.read_doc(&Self::meta_row(key)).await?;
        Ok(doc.filter(meta_live).map(|d| d.v))
    }

    async fn meta_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let doc = StoredDoc {
            v: value.to_owned(),
            expires_at: ttl.map(expiry_in),
        };
        self.write_doc(&Self::meta_row(key), &doc).await
    }

    async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
        let row = Self::meta_row(key);
        let Some(doc) = self.read_doc(&row).await? else {
            return Ok(false);
        };
        self.delete_row(&row).await?;
        Ok(meta_live(&doc))
    }

    async fn meta_compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let row = Self::meta_row(key);
        let Some(doc) = self.read_doc(&row).await? else {
            return Ok(false);
        };
        if !meta_live(&doc) || doc.v != expected {
            return Ok(false);
        }
        self.delete_row(&row).await?;
        Ok(true)
    }

    async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
        let row = Self::meta_row(key);
        let current = match self.read_doc(&row).await? {
            Some(doc) => doc
                .v
                .parse::<u64>()
                .map_err(|e| StoreError::Data(format!("corrupt counter {row:?}: {e}")))?,
            None => 0,
        };
        let doc = StoredDoc {
            v: (current + 1).to_string(),
            expires_at: None,
        };
        self.write_doc(&row, &doc).await?;
        Ok(current + 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let resp = self
            .req(Method::GET, "version/cluster")
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
    fn entry_rows_group_by_store() {
        let a = HbaseBackend::entry_row(StoreId::new(7), b"k1");
        let b = HbaseBackend::entry_row(StoreId::new(7), b"k2");
        let other = HbaseBackend::entry_row(StoreId::new(71), b"k1");
        assert!(a.starts_with("s:7:"));
        assert!(b.starts_with("s:7:"));
        assert!(!other.starts_with("s:7:"));
    }

    #[test]
    fn meta_liveness_runs_to_the_deadline() {
        // A lock lease must stay claimed for its whole duration; only
        // TTL entries expire a tolerance window early.
        let near_deadline = StoredDoc {
            v: String::new(),
            expires_at: Some(now_epoch() + SKEW_TOLERANCE_SECS),
        };
        let past_deadline = StoredDoc {
            v: String::new(),
            expires_at: Some(now_epoch() - 1),
        };
        assert!(!ttl_live(&near_deadline));
        assert!(meta_live(&near_deadline));
        assert!(!meta_live(&past_deadline));
    }

    #[test]
    fn documents_round_trip_as_json() {
        let doc = StoredDoc {
            v: String::from("abc"),
            expires_at: Some(42),
        };
        let bytes = serde_json::to_vec(&doc).unwrap();
        let back: StoredDoc = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.v, "abc");
        assert_eq!(back.expires_at, Some(42));
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use procstore_core::testing::run_backend_conformance;

    fn test_config() -> HbaseConfig {
        HbaseConfig {
            base_url: std::env::var("HBASE_REST_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            table: format!("pt{}", uuid::Uuid::new_v4().simple()),
            ..HbaseConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let backend = HbaseBackend::connect(&test_config())
            .await
            .expect("gateway should be reachable");
        run_backend_conformance(&backend)
            .await
            .expect("conformance suite should pass");
    }
}
