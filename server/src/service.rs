//! The search service: states in, queries and aggregations out.
//!
//! [`SearchService`] owns the process-wide state registry and the adapter
//! handles. Facet methods live in `facets` and `histogram`; this module
//! carries state lifecycle (including scheduling detached prompt parses)
//! and plain document search.

use crate::engine::SearchEngine;
use crate::errors::{Error, Result};
use crate::ingest::{RefCache, REF_CACHE_CAPACITY};
use crate::llm::ChatModel;
use crate::prompt;
use crate::query::to_query;
use crate::state::{SearchState, StateRegistry};
use crate::store::DocumentStore;
use peerdb_core::{props, Filters, Identifier};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Default number of documents a search returns.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

pub struct SearchService {
    engine: Arc<dyn SearchEngine>,
    store: Arc<dyn DocumentStore>,
    registry: Arc<StateRegistry>,
    llm: Option<Arc<dyn ChatModel>>,
    index: String,
    /// Cached count of property documents; 0 means not fetched yet.
    properties_total: AtomicI64,
    /// Resolved document names, for property-discovery samples.
    names: RefCache<String>,
}

/// One ranked document in a search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: Identifier,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHits {
    pub hits: Vec<SearchHit>,
    pub total: i64,
}

impl SearchService {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        store: Arc<dyn DocumentStore>,
        llm: Option<Arc<dyn ChatModel>>,
        index: &str,
    ) -> Self {
        SearchService {
            engine,
            store,
            registry: Arc::new(StateRegistry::new()),
            llm,
            index: index.to_string(),
            properties_total: AtomicI64::new(0),
            names: RefCache::new(REF_CACHE_CAPACITY),
        }
    }

    pub(crate) fn names(&self) -> &RefCache<String> {
        &self.names
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn SearchEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Resolve or create a state. Fresh prompt states get a detached parse
    /// task; everything else is ready immediately.
    pub fn get_or_create_state(
        self: &Arc<Self>,
        existing: Option<&Identifier>,
        text: Option<&str>,
        filters: Option<&Filters>,
        is_prompt: bool,
    ) -> (SearchState, bool) {
        let (state, reused) = self.registry.get_or_create(existing, text, filters, is_prompt);
        if !reused && !state.ready() {
            prompt::spawn_parse(Arc::clone(self), self.llm.clone(), state.clone());
        }
        (state, reused)
    }

    /// The compiled engine query for a ready state.
    pub fn state_query(&self, state: &SearchState) -> Result<serde_json::Value> {
        if !state.ready() {
            return Err(Error::NotReady.context("state", state.id.clone()));
        }
        Ok(to_query(&state.search_query, state.filters.as_ref()))
    }

    /// Ranked documents for a state.
    pub async fn search(&self, state_id: &Identifier, limit: usize) -> Result<SearchHits> {
        let state = self.registry.get(state_id)?;
        let query = self.state_query(&state)?;
        let body = json!({ "query": query, "size": limit, "_source": false });
        let resp = self.engine.search(&self.index, &body).await?;
        let hits = resp
            .hits
            .hits
            .into_iter()
            .filter_map(|hit| {
                let id: Identifier = hit.id.parse().ok()?;
                Some(SearchHit { id, score: hit.score.unwrap_or(0.0) })
            })
            .collect();
        Ok(SearchHits { hits, total: resp.hits.total.value })
    }

    /// The latest revision of one document, from the store.
    pub async fn document(&self, id: &Identifier) -> Result<peerdb_core::Document> {
        self.store.get_latest(id).await
    }

    /// Number of property documents in the corpus, fetched once and cached.
    /// Sizes the amount-facet cardinality threshold.
    pub async fn properties_total(&self) -> Result<i64> {
        let cached = self.properties_total.load(Ordering::Relaxed);
        if cached > 0 {
            return Ok(cached);
        }
        let query = to_query(
            "",
            Some(&Filters::rel(props::id(props::INSTANCE_OF), props::id(props::PROPERTY))),
        );
        let count = self.engine.count(&self.index, &query).await?;
        let count = count.max(1);
        self.properties_total.store(count, Ordering::Relaxed);
        Ok(count)
    }
}
