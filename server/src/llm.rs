//! LLM adapter: chat completion with tool use.
//!
//! The prompt parser speaks to the model through the [`ChatModel`] seam. The
//! concrete adapter targets an OpenAI-compatible chat-completions endpoint
//! with `temperature = 0`, an optional seed, and a bounded response length.
//! Every exchange is surfaced as a [`PromptCall`] so the full trace — tool
//! inputs, tool outputs, latencies — can be recorded on the search state.

use crate::errors::{Error, Result};
use crate::retry::{with_backoff, BackoffPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Endpoint configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub seed: Option<u64>,
    pub max_response_tokens: u32,
}

impl LlmConfig {
    /// Read `PEERDB_LLM_URL`, `PEERDB_LLM_KEY`, and `PEERDB_LLM_MODEL`.
    /// `None` when no endpoint is configured — prompt states then fail over
    /// to free-text search.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("PEERDB_LLM_URL").ok().filter(|u| !u.is_empty())?;
        let model = std::env::var("PEERDB_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Some(LlmConfig {
            url,
            api_key: std::env::var("PEERDB_LLM_KEY").ok().filter(|k| !k.is_empty()),
            model,
            temperature: 0.0,
            seed: Some(42),
            max_response_tokens: 4096,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".into(), content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".into(), content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn tool_result(call_id: &str, content: impl Into<String>) -> Self {
        ChatMessage {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as produced by the model.
    pub arguments: String,
}

/// A tool offered to the model, described by JSON schema.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// One recorded exchange with the model or a tool, kept on the search state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCall {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<Value>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// The seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// One completion round over the conversation so far.
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage>;
}

/// OpenAI-compatible chat-completions adapter.
pub struct HttpChatModel {
    http: reqwest::Client,
    config: LlmConfig,
    policy: BackoffPolicy,
    cancel: CancellationToken,
}

impl HttpChatModel {
    pub fn new(config: LlmConfig, cancel: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::fatal(format!("building HTTP client: {e}")))?;
        Ok(HttpChatModel { http, config, policy: BackoffPolicy::default(), cancel })
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage> {
        #[derive(Deserialize)]
        struct Completion {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChatMessage,
        }

        let tool_specs: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    }
                })
            })
            .collect();
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "tools": tool_specs,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_response_tokens,
        });
        if let Some(seed) = self.config.seed {
            body["seed"] = json!(seed);
        }

        let url = format!("{}/chat/completions", self.config.url.trim_end_matches('/'));
        let completion: Completion =
            with_backoff(&self.cancel, "llm.complete", &self.policy, || async {
                let mut req = self.http.post(&url).json(&body);
                if let Some(key) = &self.config.api_key {
                    req = req.bearer_auth(key);
                }
                let resp = req.send().await?;
                let status = resp.status();
                if status.as_u16() == 429 || status.is_server_error() {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    return Err(Error::Transient {
                        message: format!("model endpoint returned {status}"),
                        retry_after,
                    });
                }
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(Error::fatal(format!("model endpoint returned {status}: {text}")));
                }
                Ok(resp.json().await?)
            })
            .await
            .map_err(|e| e.context("model", self.config.model.clone()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| Error::fatal("model returned no choices"))
    }
}
