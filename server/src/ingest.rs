//! Document construction and ingestion plumbing.
//!
//! [`DocumentBuilder`] mints every claim id deterministically from
//! `(namespace, document key, property, kind, index)`, so ingesting the same
//! record twice produces byte-identical JSON. Translation helpers map
//! external typed values onto claim variants; anything inexpressible comes
//! back as `Unsupported`, and callers inspect the chain to decide skip vs
//! fail. The rest of the module is the ingestion machinery: a bounded
//! reference cache, a worker pool draining a bounded channel, and an HTTP
//! reader that resumes mid-stream with `Range` requests.

use crate::engine::{BulkProcessor, BulkStats, SearchEngine};
use crate::errors::{Error, Result};
use crate::retry::BackoffPolicy;
use crate::store::DocumentStore;
use lru::LruCache;
use peerdb_core::claim::{
    AmountClaim, AmountRangeClaim, Claim, ClaimMeta, DocumentRef, IdentifierClaim, NoValueClaim,
    ReferenceClaim, RelationClaim, StringClaim, TextClaim, TimeClaim, TimeRangeClaim,
    UnknownValueClaim,
};
use peerdb_core::{props, AmountUnit, Document, Identifier, TimePrecision, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on the producer→worker channel.
const INGEST_CHANNEL_BOUND: usize = 1024;

/// Entries held by the document-reference cache.
pub const REF_CACHE_CAPACITY: usize = 1_000_000;

/// External datasets mark an explicitly absent channel with this sentinel.
/// It collapses to a `NoValue` claim; other unset scalars drop silently.
pub const NO_TRADE_CHANNEL: &str = "NO_TRADE_CHANNEL";

// ---------------------------------------------------------------------------
// Document builder
// ---------------------------------------------------------------------------

/// Deterministic construction of a claim-carrying document.
pub struct DocumentBuilder {
    doc: Document,
    namespace: Uuid,
    key: String,
    confidence: f64,
    serial: HashMap<(String, &'static str), usize>,
}

impl DocumentBuilder {
    /// Start a document for the external record `key`. The document id is
    /// `uuid_v5(namespace, key)`; the score seeds every claim's confidence.
    pub fn new(namespace: Uuid, key: &str, score: f64) -> Self {
        let id = Identifier::from_uuid_v5(&namespace, key);
        DocumentBuilder {
            doc: Document::new(id, score),
            namespace,
            key: key.to_string(),
            confidence: score,
            serial: HashMap::new(),
        }
    }

    pub fn id(&self) -> &Identifier {
        self.doc.id()
    }

    fn mint(&mut self, prop: &str, kind: &'static str) -> ClaimMeta {
        let serial = self.serial.entry((prop.to_string(), kind)).or_insert(0);
        let index = *serial;
        *serial += 1;
        let name = format!("{}/{}/{}/{}", self.key, prop, kind, index);
        ClaimMeta::new(
            Identifier::from_uuid_v5(&self.namespace, &name),
            self.confidence,
            props::id(prop),
        )
    }

    pub fn text(&mut self, prop: &str, language: &str, html: &str) -> Result<&mut Self> {
        let meta = self.mint(prop, "text");
        let mut map = BTreeMap::new();
        map.insert(language.to_string(), html.to_string());
        self.doc.add(Claim::Text(TextClaim::from_html(meta, map)))?;
        Ok(self)
    }

    pub fn string(&mut self, prop: &str, value: &str) -> Result<&mut Self> {
        let meta = self.mint(prop, "string");
        self.doc.add(Claim::String(StringClaim::new(meta, value)))?;
        Ok(self)
    }

    pub fn identifier(&mut self, prop: &str, value: &str) -> Result<&mut Self> {
        let meta = self.mint(prop, "id");
        self.doc.add(Claim::Id(IdentifierClaim { meta, identifier: value.to_string() }))?;
        Ok(self)
    }

    pub fn reference(&mut self, prop: &str, iri: &str) -> Result<&mut Self> {
        let meta = self.mint(prop, "ref");
        self.doc.add(Claim::Ref(ReferenceClaim { meta, iri: iri.to_string() }))?;
        Ok(self)
    }

    pub fn amount(&mut self, prop: &str, amount: f64, unit: AmountUnit) -> Result<&mut Self> {
        let meta = self.mint(prop, "amount");
        self.doc.add(Claim::Amount(AmountClaim { meta, amount, unit }))?;
        Ok(self)
    }

    pub fn amount_range(
        &mut self,
        prop: &str,
        lower: f64,
        upper: f64,
        unit: AmountUnit,
    ) -> Result<&mut Self> {
        let meta = self.mint(prop, "amount_range");
        self.doc.add(Claim::AmountRange(AmountRangeClaim { meta, lower, upper, unit }))?;
        Ok(self)
    }

    pub fn time(
        &mut self,
        prop: &str,
        timestamp: Timestamp,
        precision: TimePrecision,
    ) -> Result<&mut Self> {
        let meta = self.mint(prop, "time");
        self.doc.add(Claim::Time(TimeClaim { meta, timestamp, precision }))?;
        Ok(self)
    }

    pub fn time_range(
        &mut self,
        prop: &str,
        lower: Timestamp,
        upper: Timestamp,
        precision: TimePrecision,
    ) -> Result<&mut Self> {
        let meta = self.mint(prop, "time_range");
        self.doc.add(Claim::TimeRange(TimeRangeClaim { meta, lower, upper, precision }))?;
        Ok(self)
    }

    pub fn rel(&mut self, prop: &str, to: Identifier) -> Result<&mut Self> {
        let meta = self.mint(prop, "rel");
        self.doc.add(Claim::Rel(RelationClaim { meta, to: DocumentRef { id: to } }))?;
        Ok(self)
    }

    pub fn no_value(&mut self, prop: &str) -> Result<&mut Self> {
        let meta = self.mint(prop, "none");
        self.doc.add(Claim::NoValue(NoValueClaim { meta }))?;
        Ok(self)
    }

    pub fn unknown_value(&mut self, prop: &str) -> Result<&mut Self> {
        let meta = self.mint(prop, "unknown");
        self.doc.add(Claim::UnknownValue(UnknownValueClaim { meta }))?;
        Ok(self)
    }

    pub fn finish(self) -> Document {
        self.doc
    }
}

// ---------------------------------------------------------------------------
// External value translation
// ---------------------------------------------------------------------------

/// A typed value as delivered by an external dataset.
#[derive(Debug, Clone)]
pub enum SourceValue {
    Monolingual { language: String, html: String },
    Quantity { value: f64, unit: String },
    Instant { value: String, precision: TimePrecision },
    Entity { id: Identifier },
    Scalar { value: String },
    /// Anything the ingester has no mapping for.
    Raw { datatype: String, value: serde_json::Value },
}

/// Translate one external value into a claim on the builder. Unsupported
/// datatypes and unknown units surface as `Unsupported` so the caller can
/// decide skip vs fail.
pub fn add_source_value(
    builder: &mut DocumentBuilder,
    prop: &str,
    value: &SourceValue,
) -> Result<()> {
    match value {
        SourceValue::Monolingual { language, html } => {
            builder.text(prop, language, html)?;
        }
        SourceValue::Quantity { value, unit } => {
            let unit = AmountUnit::from_str(unit).map_err(|e| {
                Error::unsupported(e.to_string()).context("prop", prop.to_string())
            })?;
            builder.amount(prop, *value, unit)?;
        }
        SourceValue::Instant { value, precision } => {
            let timestamp = Timestamp::from_str(value)?;
            builder.time(prop, timestamp, *precision)?;
        }
        SourceValue::Entity { id } => {
            builder.rel(prop, id.clone())?;
        }
        SourceValue::Scalar { value } => {
            builder.string(prop, value)?;
        }
        SourceValue::Raw { datatype, .. } => {
            return Err(Error::unsupported(format!("datatype {datatype:?}"))
                .context("prop", prop.to_string()));
        }
    }
    Ok(())
}

/// Scalar translation with an explicit-absence sentinel: the sentinel
/// becomes a `NoValue` claim, the empty string drops silently, anything
/// else is a string claim.
pub fn string_or_sentinel(
    builder: &mut DocumentBuilder,
    prop: &str,
    raw: &str,
    sentinel: &str,
) -> Result<()> {
    if raw.is_empty() {
        return Ok(());
    }
    if raw == sentinel {
        builder.no_value(prop)?;
        return Ok(());
    }
    builder.string(prop, raw)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Core corpus documents
// ---------------------------------------------------------------------------

/// The documents `populate` seeds: claim-type sentinels, the `PROPERTY`
/// class, and one property document per core property.
pub fn core_documents() -> Result<Vec<Document>> {
    let mut docs = Vec::new();

    let mut property = DocumentBuilder::new(props::NAMESPACE, props::PROPERTY, 1.0);
    property
        .text(props::NAME, "en", "property")?
        .text(props::DESCRIPTION, "en", "The class of all properties.")?;
    docs.push(property.finish());

    for sentinel in props::CLAIM_TYPE_SENTINELS {
        let mut builder = DocumentBuilder::new(props::NAMESPACE, sentinel, 1.0);
        let name = sentinel.replace('_', " ").to_lowercase();
        builder.text(props::NAME, "en", &name)?;
        docs.push(builder.finish());
    }

    for core in props::CORE_PROPERTIES {
        let mut builder = DocumentBuilder::new(props::NAMESPACE, core.mnemonic, 1.0);
        builder
            .text(props::NAME, "en", core.name)?
            .text(props::DESCRIPTION, "en", core.description)?
            .rel(props::INSTANCE_OF, props::id(props::PROPERTY))?;
        for claim_type in core.claim_types {
            builder.rel(props::TYPE, props::id(claim_type))?;
        }
        docs.push(builder.finish());
    }
    Ok(docs)
}

/// Create the index and seed the core documents. Idempotent: ids are
/// deterministic and writes replace whole documents.
pub async fn populate(
    engine: &Arc<dyn SearchEngine>,
    store: &Arc<dyn DocumentStore>,
    index: &str,
) -> Result<usize> {
    engine.create_index(index, &crate::engine::index_mapping()).await?;
    let docs = core_documents()?;
    for doc in &docs {
        store.insert_or_replace(doc).await?;
        let body = serde_json::to_value(doc)?;
        engine.index_doc(index, doc.id(), &body, None).await?;
    }
    info!(count = docs.len(), "seeded core documents");
    Ok(docs.len())
}

// ---------------------------------------------------------------------------
// Reference cache
// ---------------------------------------------------------------------------

/// Bounded LRU of resolved document references with atomic miss counting.
pub struct RefCache<V> {
    inner: Mutex<LruCache<Identifier, V>>,
    misses: AtomicU64,
}

impl<V: Clone> RefCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        RefCache { inner: Mutex::new(LruCache::new(capacity)), misses: AtomicU64::new(0) }
    }

    pub fn get(&self, key: &Identifier) -> Option<V> {
        let mut cache = self.inner.lock().expect("cache lock");
        let hit = cache.get(key).cloned();
        if hit.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn put(&self, key: Identifier, value: V) {
        self.inner.lock().expect("cache lock").put(key, value);
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Totals from one import run.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub stored: u64,
    pub indexed: u64,
    pub failed: u64,
}

/// Drain `rx` with one worker per core: every document is stored and queued
/// on a bulk processor. Returns merged totals once the channel closes.
pub async fn index_documents(
    engine: Arc<dyn SearchEngine>,
    store: Arc<dyn DocumentStore>,
    index: &str,
    rx: mpsc::Receiver<Document>,
) -> Result<IngestReport> {
    let workers = num_cpus::get().max(1);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let stats = Arc::new(BulkStats::default());
    let stored = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let rx = Arc::clone(&rx);
        let stats = Arc::clone(&stats);
        let stored = Arc::clone(&stored);
        let engine = Arc::clone(&engine);
        let store = Arc::clone(&store);
        let index = index.to_string();
        handles.push(tokio::spawn(async move {
            let mut bulk = BulkProcessor::new(engine, &index, stats).on_failure(move |id, reason| {
                warn!(worker, document = id, reason, "bulk indexing failed");
            });
            loop {
                let doc = { rx.lock().await.recv().await };
                let Some(doc) = doc else { break };
                if let Err(err) = store.insert_or_replace(&doc).await {
                    warn!(worker, document = %doc.id(), error = %err, "store write failed");
                    continue;
                }
                stored.fetch_add(1, Ordering::Relaxed);
                let body = match serde_json::to_value(&doc) {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(worker, document = %doc.id(), error = %err, "serialization failed");
                        continue;
                    }
                };
                if let Err(err) = bulk.add(doc.id().clone(), body).await {
                    warn!(worker, error = %err, "bulk batch failed");
                }
            }
            if let Err(err) = bulk.finish().await {
                warn!(worker, error = %err, "bulk flush failed");
            }
        }));
    }
    for handle in handles {
        handle.await.map_err(|e| Error::fatal(format!("ingest worker panicked: {e}")))?;
    }
    Ok(IngestReport {
        stored: stored.load(Ordering::Relaxed),
        indexed: stats.indexed.load(Ordering::Relaxed),
        failed: stats.failed.load(Ordering::Relaxed),
    })
}

/// Import newline-delimited document JSON from a local path or URL. Remote
/// data lands in the cache directory first via the ranged reader.
pub async fn run_import(
    engine: Arc<dyn SearchEngine>,
    store: Arc<dyn DocumentStore>,
    index: &str,
    data: &str,
    cache_dir: &Path,
    cancel: CancellationToken,
) -> Result<IngestReport> {
    let path = if data.starts_with("http://") || data.starts_with("https://") {
        let file_name = data.rsplit('/').next().unwrap_or("data.jsonl");
        let target = cache_dir.join(file_name);
        if target.exists() {
            debug!(path = %target.display(), "using cached dataset");
        } else {
            std::fs::create_dir_all(cache_dir)
                .map_err(|e| Error::fatal(format!("creating cache dir: {e}")))?;
            let reader = RangedReader::new(data, cancel.clone())?;
            let mut file = std::fs::File::create(&target)
                .map_err(|e| Error::fatal(format!("creating cache file: {e}")))?;
            use std::io::Write;
            let bytes = reader
                .download(|chunk| {
                    file.write_all(chunk).map_err(|e| Error::fatal(format!("writing cache: {e}")))
                })
                .await?;
            info!(bytes, path = %target.display(), "downloaded dataset");
        }
        target
    } else {
        Path::new(data).to_path_buf()
    };

    let (tx, rx) = mpsc::channel(INGEST_CHANNEL_BOUND);
    let producer = tokio::task::spawn_blocking(move || -> Result<u64> {
        use std::io::BufRead;
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::not_found(format!("dataset {}: {e}", path.display())))?;
        let mut lines = 0u64;
        for line in std::io::BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::fatal(format!("reading dataset: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Document = serde_json::from_str(&line)
                .map_err(|e| Error::invalid(format!("bad document JSON: {e}")).context("line", lines + 1))?;
            if tx.blocking_send(doc).is_err() {
                break;
            }
            lines += 1;
        }
        Ok(lines)
    });

    let report = index_documents(engine, store, index, rx).await?;
    producer.await.map_err(|e| Error::fatal(format!("producer panicked: {e}")))??;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Ranged HTTP reader
// ---------------------------------------------------------------------------

/// HTTP download that restarts mid-stream on transient errors using
/// `Range: bytes=<downloaded>-`, verifying `Content-Length` on every retry.
pub struct RangedReader {
    http: reqwest::Client,
    url: String,
    policy: BackoffPolicy,
    cancel: CancellationToken,
}

impl RangedReader {
    pub fn new(url: &str, cancel: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::fatal(format!("building HTTP client: {e}")))?;
        Ok(RangedReader { http, url: url.to_string(), policy: BackoffPolicy::default(), cancel })
    }

    /// Stream the resource into `sink`, returning the byte count.
    pub async fn download(&self, mut sink: impl FnMut(&[u8]) -> Result<()>) -> Result<u64> {
        let mut downloaded: u64 = 0;
        let mut total: Option<u64> = None;
        let mut attempt = 1u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.stream_once(&mut sink, &mut downloaded, &mut total).await {
                Ok(()) => return Ok(downloaded),
                Err(err) if err.is_transient() && attempt < self.policy.attempts => {
                    warn!(url = %self.url, downloaded, attempt, error = %err, "restarting download");
                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.initial * attempt) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err.context("url", self.url.clone())),
            }
        }
    }

    async fn stream_once(
        &self,
        sink: &mut impl FnMut(&[u8]) -> Result<()>,
        downloaded: &mut u64,
        total: &mut Option<u64>,
    ) -> Result<()> {
        let mut req = self.http.get(&self.url);
        if *downloaded > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={downloaded}-"));
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::transient(format!("server returned {status}")));
        }
        if *downloaded > 0 && status.as_u16() != 206 {
            return Err(Error::fatal(format!("server ignored range request ({status})")));
        }
        if !status.is_success() {
            return Err(Error::fatal(format!("server returned {status}")));
        }
        if let Some(len) = resp.content_length() {
            let expected = *downloaded + len;
            match total {
                None => *total = Some(expected),
                Some(t) if *t != expected => {
                    return Err(Error::fatal(format!(
                        "content length changed mid-download ({t} != {expected})"
                    )));
                }
                _ => {}
            }
        }
        let mut resp = resp;
        while let Some(chunk) = resp.chunk().await? {
            sink(&chunk)?;
            *downloaded += chunk.len() as u64;
        }
        if let Some(t) = *total {
            if *downloaded < t {
                return Err(Error::transient(format!(
                    "connection closed early ({downloaded} of {t} bytes)"
                )));
            }
        }
        Ok(())
    }
}
