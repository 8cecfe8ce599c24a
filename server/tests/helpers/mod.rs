//! Test harness for search-flow integration tests.
//!
//! Builds a `SearchService` over a scriptable mock engine and a scripted
//! chat model — no subprocess, no network. Tests queue raw engine responses
//! in call order and assert on the recorded request bodies.

use async_trait::async_trait;
use peerdb_core::{Document, Identifier};
use peerdb_server::engine::{BulkResponse, DocVersion, SearchEngine, SearchResponse};
use peerdb_server::errors::{Error, Result};
use peerdb_server::llm::{ChatMessage, ChatModel, ToolSpec};
use peerdb_server::service::SearchService;
use peerdb_server::store::MemoryStore;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A search engine that replays queued responses and records every request.
#[derive(Default)]
pub struct MockEngine {
    responses: Mutex<VecDeque<Value>>,
    pub requests: Mutex<Vec<Value>>,
    pub indexed: Mutex<Vec<(Identifier, Value)>>,
    count: Mutex<i64>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEngine { count: Mutex::new(1), ..MockEngine::default() })
    }

    /// Queue the next raw search response.
    pub fn push(&self, response: Value) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_count(&self, count: i64) {
        *self.count.lock().unwrap() = count;
    }

    /// The body of the `n`-th search request.
    pub fn request(&self, n: usize) -> Value {
        self.requests.lock().unwrap()[n].clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_response(&self) -> Value {
        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            json!({ "took": 1, "hits": { "total": { "value": 0 }, "hits": [] } })
        })
    }
}

#[async_trait]
impl SearchEngine for MockEngine {
    async fn search(&self, _index: &str, body: &Value) -> Result<SearchResponse> {
        self.requests.lock().unwrap().push(body.clone());
        let raw = self.next_response();
        Ok(serde_json::from_value(raw).expect("well-formed mock response"))
    }

    async fn count(&self, _index: &str, _query: &Value) -> Result<i64> {
        Ok(*self.count.lock().unwrap())
    }

    async fn create_index(&self, _index: &str, _mapping: &Value) -> Result<()> {
        Ok(())
    }

    async fn get_doc(
        &self,
        _index: &str,
        _id: &Identifier,
    ) -> Result<Option<(Document, DocVersion)>> {
        Ok(None)
    }

    async fn index_doc(
        &self,
        _index: &str,
        id: &Identifier,
        doc: &Value,
        _version: Option<DocVersion>,
    ) -> Result<()> {
        self.indexed.lock().unwrap().push((id.clone(), doc.clone()));
        Ok(())
    }

    async fn bulk(&self, _index: &str, body: String) -> Result<BulkResponse> {
        let actions = body.lines().count() / 2;
        for pair in body.lines().collect::<Vec<_>>().chunks(2) {
            let header: Value = serde_json::from_str(pair[0]).expect("bulk header");
            let id: Identifier =
                header["index"]["_id"].as_str().expect("bulk id").parse().expect("valid id");
            let doc: Value = serde_json::from_str(pair[1]).expect("bulk document");
            self.indexed.lock().unwrap().push((id, doc));
        }
        Ok(BulkResponse { errors: false, items: vec![json!({}); actions] })
    }
}

/// A chat model that replays scripted replies, optionally after a delay.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ChatMessage>>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<ChatMessage>>) -> Arc<Self> {
        Arc::new(ScriptedModel { replies: Mutex::new(replies.into()), delay: None })
    }

    /// A model that stalls before answering — for not-ready scenarios.
    pub fn stalled(delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedModel { replies: Mutex::new(VecDeque::new()), delay: Some(delay) })
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, _messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ChatMessage> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::transient("script exhausted")))
    }
}

/// An assistant message carrying one tool call.
pub fn tool_call_message(name: &str, arguments: Value) -> ChatMessage {
    serde_json::from_value(json!({
        "role": "assistant",
        "content": null,
        "tool_calls": [{
            "id": "call_0",
            "type": "function",
            "function": { "name": name, "arguments": arguments.to_string() }
        }]
    }))
    .expect("well-formed tool call")
}

/// An assistant message with raw (possibly malformed) tool arguments.
pub fn raw_tool_call_message(name: &str, arguments: &str) -> ChatMessage {
    serde_json::from_value(json!({
        "role": "assistant",
        "content": null,
        "tool_calls": [{
            "id": "call_0",
            "type": "function",
            "function": { "name": name, "arguments": arguments }
        }]
    }))
    .expect("well-formed tool call")
}

pub struct TestHarness {
    pub engine: Arc<MockEngine>,
    pub service: Arc<SearchService>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_model(None)
    }

    pub fn with_model(model: Option<Arc<dyn ChatModel>>) -> Self {
        let engine = MockEngine::new();
        let service = Arc::new(SearchService::new(
            Arc::clone(&engine) as Arc<dyn SearchEngine>,
            Arc::new(MemoryStore::new()),
            model,
            "docs",
        ));
        TestHarness { engine, service }
    }

    /// Poll until the state is ready, failing after a bounded wait.
    pub async fn wait_ready(&self, id: &Identifier) -> peerdb_server::SearchState {
        for _ in 0..200 {
            let state = self.service.registry().get(id).expect("state exists");
            if state.ready() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state {id} never became ready");
    }
}

/// A canned terms-facet response with the given string buckets.
pub fn terms_response(buckets: &[(&str, i64)], cardinality: i64) -> Value {
    let buckets: Vec<Value> = buckets
        .iter()
        .map(|(key, count)| json!({ "key": key, "doc_count": count, "docs": { "doc_count": count } }))
        .collect();
    json!({
        "took": 2,
        "hits": { "total": { "value": 0 }, "hits": [] },
        "aggregations": {
            "facet": { "doc_count": 10, "scoped": {
                "doc_count": 10,
                "values": { "buckets": buckets },
                "distinct": { "value": cardinality }
            } }
        }
    })
}
