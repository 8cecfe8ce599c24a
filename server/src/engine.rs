//! Search-engine adapter.
//!
//! The aggregation engine and query compiler speak to the engine through the
//! [`SearchEngine`] seam; [`HttpSearchEngine`] is the concrete JSON-over-HTTP
//! adapter. Every round-trip goes through the backoff wrapper and honors
//! `Retry-After`. Bulk indexing batches operations, reports per-batch
//! failures through a callback, and exposes counters.

use crate::errors::{Error, Result};
use crate::retry::{with_backoff, BackoffPolicy};
use async_trait::async_trait;
use peerdb_core::{Document, Identifier};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Documents indexed per bulk flush.
const BULK_BATCH_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A search response, as deserialized from the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    /// Engine-reported internal time, in milliseconds.
    #[serde(default)]
    pub took: u64,
    pub hits: Hits,
    #[serde(default)]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hits {
    pub total: HitsTotal,
    #[serde(default)]
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HitsTotal {
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_score", default)]
    pub score: Option<f64>,
    #[serde(rename = "_source", default)]
    pub source: Option<Value>,
}

/// Sequence number and primary term for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DocVersion {
    pub seq_no: i64,
    pub primary_term: i64,
}

// ---------------------------------------------------------------------------
// The seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Run a search request against `index`.
    async fn search(&self, index: &str, body: &Value) -> Result<SearchResponse>;

    /// Count documents matching `query`.
    async fn count(&self, index: &str, query: &Value) -> Result<i64>;

    /// Create `index` with the supplied mapping. Succeeds if it already exists.
    async fn create_index(&self, index: &str, mapping: &Value) -> Result<()>;

    /// Fetch one document with its concurrency version, `None` when absent.
    async fn get_doc(&self, index: &str, id: &Identifier) -> Result<Option<(Document, DocVersion)>>;

    /// Index one document. A version makes the write conditional
    /// (`if_seq_no`/`if_primary_term`); conflicts surface as transient.
    async fn index_doc(
        &self,
        index: &str,
        id: &Identifier,
        doc: &Value,
        version: Option<DocVersion>,
    ) -> Result<()>;

    /// Submit a newline-delimited bulk payload, returning per-item outcomes.
    async fn bulk(&self, index: &str, body: String) -> Result<BulkResponse>;
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

pub struct HttpSearchEngine {
    http: reqwest::Client,
    base: String,
    policy: BackoffPolicy,
    cancel: CancellationToken,
}

impl HttpSearchEngine {
    pub fn new(base_url: &str, cancel: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::fatal(format!("building HTTP client: {e}")))?;
        Ok(HttpSearchEngine {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            policy: BackoffPolicy::default(),
            cancel,
        })
    }

    /// Translate a non-success response into an error, reading the
    /// `Retry-After` header for throttled and unavailable responses.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::Transient {
                message: format!("engine returned {status}: {body}"),
                retry_after,
            });
        }
        if status.as_u16() == 404 {
            return Err(Error::not_found("engine resource"));
        }
        if status.as_u16() == 409 {
            // Version conflict: the caller re-reads and retries.
            return Err(Error::transient(format!("version conflict: {body}")));
        }
        Err(Error::fatal(format!("engine returned {status}: {body}")))
    }
}

#[async_trait]
impl SearchEngine for HttpSearchEngine {
    async fn search(&self, index: &str, body: &Value) -> Result<SearchResponse> {
        let url = format!("{}/{}/_search", self.base, index);
        with_backoff(&self.cancel, "engine.search", &self.policy, || async {
            let resp = self.http.post(&url).json(body).send().await?;
            let resp = Self::check(resp).await?;
            Ok(resp.json::<SearchResponse>().await?)
        })
        .await
        .map_err(|e| e.context("index", index))
    }

    async fn count(&self, index: &str, query: &Value) -> Result<i64> {
        #[derive(Deserialize)]
        struct CountResponse {
            count: i64,
        }
        let url = format!("{}/{}/_count", self.base, index);
        let body = json!({ "query": query });
        with_backoff(&self.cancel, "engine.count", &self.policy, || async {
            let resp = self.http.post(&url).json(&body).send().await?;
            let resp = Self::check(resp).await?;
            Ok(resp.json::<CountResponse>().await?.count)
        })
        .await
        .map_err(|e| e.context("index", index))
    }

    async fn create_index(&self, index: &str, mapping: &Value) -> Result<()> {
        let url = format!("{}/{}", self.base, index);
        let out = with_backoff(&self.cancel, "engine.create_index", &self.policy, || async {
            let resp = self.http.put(&url).json(mapping).send().await?;
            if resp.status().as_u16() == 400 {
                let body = resp.text().await.unwrap_or_default();
                if body.contains("resource_already_exists_exception") {
                    return Ok(false);
                }
                return Err(Error::invalid(format!("engine rejected mapping: {body}")));
            }
            Self::check(resp).await?;
            Ok(true)
        })
        .await
        .map_err(|e| e.context("index", index))?;
        if out {
            info!(index, "created index");
        } else {
            debug!(index, "index already exists");
        }
        Ok(())
    }

    async fn get_doc(&self, index: &str, id: &Identifier) -> Result<Option<(Document, DocVersion)>> {
        #[derive(Deserialize)]
        struct GetResponse {
            found: bool,
            #[serde(rename = "_seq_no", default)]
            seq_no: i64,
            #[serde(rename = "_primary_term", default)]
            primary_term: i64,
            #[serde(rename = "_source", default)]
            source: Option<Document>,
        }
        let url = format!("{}/{}/_doc/{}", self.base, index, id);
        with_backoff(&self.cancel, "engine.get_doc", &self.policy, || async {
            let resp = self.http.get(&url).send().await?;
            if resp.status().as_u16() == 404 {
                return Ok(None);
            }
            let resp = Self::check(resp).await?;
            let get: GetResponse = resp.json().await?;
            match (get.found, get.source) {
                (true, Some(doc)) => {
                    Ok(Some((doc, DocVersion { seq_no: get.seq_no, primary_term: get.primary_term })))
                }
                _ => Ok(None),
            }
        })
        .await
        .map_err(|e| e.context("document", id.clone()))
    }

    async fn index_doc(
        &self,
        index: &str,
        id: &Identifier,
        doc: &Value,
        version: Option<DocVersion>,
    ) -> Result<()> {
        let mut url = format!("{}/{}/_doc/{}", self.base, index, id);
        if let Some(v) = version {
            url = format!("{url}?if_seq_no={}&if_primary_term={}", v.seq_no, v.primary_term);
        }
        with_backoff(&self.cancel, "engine.index_doc", &self.policy, || async {
            let resp = self.http.put(&url).json(doc).send().await?;
            Self::check(resp).await?;
            Ok(())
        })
        .await
        .map_err(|e| e.context("document", id.clone()))
    }

    async fn bulk(&self, index: &str, body: String) -> Result<BulkResponse> {
        let url = format!("{}/{}/_bulk", self.base, index);
        with_backoff(&self.cancel, "engine.bulk", &self.policy, || async {
            let resp = self
                .http
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body.clone())
                .send()
                .await?;
            let resp = Self::check(resp).await?;
            Ok(resp.json::<BulkResponse>().await?)
        })
        .await
        .map_err(|e| e.context("index", index))
    }
}

// ---------------------------------------------------------------------------
// Bulk processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Counters shared across every worker's bulk processor.
#[derive(Debug, Default)]
pub struct BulkStats {
    pub indexed: AtomicU64,
    pub failed: AtomicU64,
    pub batches: AtomicU64,
}

type FailureCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Batches index operations and flushes them in bulk. Per-item failures go
/// to the callback; totals accumulate in [`BulkStats`].
pub struct BulkProcessor {
    engine: Arc<dyn SearchEngine>,
    index: String,
    batch: Vec<(Identifier, Value)>,
    stats: Arc<BulkStats>,
    on_failure: Option<FailureCallback>,
}

impl BulkProcessor {
    pub fn new(engine: Arc<dyn SearchEngine>, index: &str, stats: Arc<BulkStats>) -> Self {
        BulkProcessor { engine, index: index.to_string(), batch: Vec::new(), stats, on_failure: None }
    }

    pub fn on_failure(mut self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Queue one document, flushing when the batch is full.
    pub async fn add(&mut self, id: Identifier, doc: Value) -> Result<()> {
        self.batch.push((id, doc));
        if self.batch.len() >= BULK_BATCH_SIZE {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send the pending batch.
    pub async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for (id, doc) in &self.batch {
            body.push_str(&json!({ "index": { "_id": id.as_str() } }).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        let count = self.batch.len() as u64;
        self.batch.clear();

        let resp = self.engine.bulk(&self.index, body).await?;
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        if !resp.errors {
            self.stats.indexed.fetch_add(count, Ordering::Relaxed);
            return Ok(());
        }
        let mut failed = 0u64;
        for item in &resp.items {
            let op = &item["index"];
            if let Some(error) = op.get("error") {
                failed += 1;
                let id = op["_id"].as_str().unwrap_or("?");
                let reason = error["reason"].as_str().unwrap_or("unknown");
                if let Some(cb) = &self.on_failure {
                    cb(id, reason);
                }
            }
        }
        self.stats.failed.fetch_add(failed, Ordering::Relaxed);
        self.stats.indexed.fetch_add(count - failed, Ordering::Relaxed);
        Ok(())
    }

    /// Flush the tail and hand back the shared counters.
    pub async fn finish(mut self) -> Result<Arc<BulkStats>> {
        self.flush().await?;
        Ok(self.stats)
    }
}

// ---------------------------------------------------------------------------
// Index mapping
// ---------------------------------------------------------------------------

/// The mapping `populate` creates the index with: one nested object per
/// claim-kind bucket, keyword property ids, and the `_size` pseudo-field
/// the Size filter consumes.
pub fn index_mapping() -> Value {
    let meta = json!({
        "id": { "type": "keyword" },
        "confidence": { "type": "double" },
        "prop": { "properties": { "id": { "type": "keyword" } } }
    });
    let nested = |extra: Value| {
        let mut properties = meta.clone();
        for (k, v) in extra.as_object().unwrap() {
            properties[k.as_str()] = v.clone();
        }
        json!({ "type": "nested", "properties": properties })
    };
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0
        },
        "mappings": {
            "_size": { "enabled": true },
            "properties": {
                "id": { "type": "keyword" },
                "score": { "type": "double" },
                "claims": {
                    "properties": {
                        "id": nested(json!({ "identifier": { "type": "keyword" } })),
                        "ref": nested(json!({ "iri": { "type": "keyword" } })),
                        "text": nested(json!({
                            "html": { "properties": { "en": { "type": "text" } } },
                            "plain": { "properties": { "en": { "type": "text" } } }
                        })),
                        "string": nested(json!({ "string": { "type": "keyword" } })),
                        "amount": nested(json!({
                            "amount": { "type": "double" },
                            "unit": { "type": "keyword" }
                        })),
                        "amount_range": nested(json!({
                            "lower": { "type": "double" },
                            "upper": { "type": "double" },
                            "unit": { "type": "keyword" }
                        })),
                        "rel": nested(json!({ "to": { "properties": { "id": { "type": "keyword" } } } })),
                        "time": nested(json!({
                            "timestamp": { "type": "date" },
                            "precision": { "type": "keyword" }
                        })),
                        "time_range": nested(json!({
                            "lower": { "type": "date" },
                            "upper": { "type": "date" },
                            "precision": { "type": "keyword" }
                        })),
                        "duration": nested(json!({ "amount": { "type": "double" } })),
                        "duration_range": nested(json!({
                            "lower": { "type": "double" },
                            "upper": { "type": "double" }
                        })),
                        "file": nested(json!({
                            "media_type": { "type": "keyword" },
                            "url": { "type": "keyword" }
                        })),
                        "list": nested(json!({
                            "element": { "properties": { "id": { "type": "keyword" } } },
                            "order": { "type": "double" }
                        })),
                        "none": nested(json!({})),
                        "unknown": nested(json!({}))
                    }
                }
            }
        }
    })
}
