//! Provider abstraction: the wire-level streaming contract.
//!
//! A [`ProviderClient`] exposes exactly two operations:
//!
//! - [`stream`](ProviderClient::stream): run one streaming completion and
//!   yield typed [`StreamEvent`]s until the provider closes the stream or a
//!   typed error surfaces.
//! - [`count_tokens`](ProviderClient::count_tokens): best-effort token
//!   counting; implementations may return `None` and are never retried.
//!
//! [`HttpProviderClient`] is the bundled implementation: an SSE client over
//! the provider's messages endpoint. Tests use scripted in-process clients
//! instead of the network.

use crate::error::{Error, Result};
use crate::types::{Message, StopReason, Usage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// A finite sequence of provider events, ending when the provider closes
/// the stream or an error item surfaces.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Everything needed for one streaming request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    /// Beta feature tags forwarded as a request header
    #[serde(skip)]
    pub beta_headers: Vec<String>,
    /// Provider-specific options merged into the payload verbatim
    /// (e.g. a `thinking` budget)
    #[serde(skip)]
    pub extra_options: serde_json::Map<String, Value>,
}

/// Contract every provider implementation satisfies.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Open a streaming completion. The returned sequence is finite; it
    /// terminates normally at `message_stop` / end of stream, or with a
    /// typed error item.
    async fn stream(&self, request: &ProviderRequest) -> Result<EventStream>;

    /// Best-effort token count for a prepared request. `Ok(None)` means the
    /// provider could not count; callers fall back to heuristics and never
    /// retry this call.
    async fn count_tokens(&self, request: &ProviderRequest) -> Result<Option<u64>>;
}

// ============================================================================
// STREAM EVENT MODEL
// ============================================================================

/// One provider streaming event, in the provider's own vocabulary.
///
/// Unknown event types are skipped by the HTTP client rather than failing
/// the stream, per the provider's versioning policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: RawContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Usage,
    },
    MessageStop,
    Ping,
    Error {
        error: Value,
    },
}

/// The skeleton message carried by `message_start`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
}

/// Top-level message changes carried by `message_delta`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

/// The opening shape of a content block from `content_block_start`.
///
/// `block_type` is kept as a string because server tool results arrive
/// under many concrete names (`web_search_tool_result`, …); the formatter
/// pattern-matches on the suffix.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// An incremental update to an open content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

/// Wire protocol version header value.
const API_VERSION: &str = "2023-06-01";

/// SSE-based provider client over the messages endpoint.
///
/// Maps HTTP status codes onto the crate's error taxonomy so the retry
/// driver can classify failures without knowing about HTTP.
pub struct HttpProviderClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpProviderClient {
    /// Create a client for `base_url` (no trailing slash) with a per-request
    /// timeout in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the URL is not http(s) or the HTTP
    /// client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config("base_url must start with http:// or https://"));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    fn payload(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("model".into(), Value::String(request.model.clone()));
        body.insert(
            "messages".into(),
            serde_json::to_value(&request.messages).unwrap_or_default(),
        );
        if let Some(system) = &request.system {
            if !system.is_empty() {
                body.insert("system".into(), Value::String(system.clone()));
            }
        }
        if !request.tools.is_empty() {
            body.insert("tools".into(), Value::Array(request.tools.clone()));
        }
        if stream {
            body.insert("max_tokens".into(), request.max_tokens.into());
            body.insert("stream".into(), Value::Bool(true));
        }
        for (key, value) in &request.extra_options {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }

    fn request_builder(&self, path: &str, request: &ProviderRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json");
        if !request.beta_headers.is_empty() {
            builder = builder.header("anthropic-beta", request.beta_headers.join(","));
        }
        builder
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn stream(&self, request: &ProviderRequest) -> Result<EventStream> {
        let response = self
            .request_builder("/v1/messages", request)
            .json(&self.payload(request, true))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable error body".to_string());
            return Err(Error::from_status(status, body));
        }

        let events = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) => parse_sse_data(&event.data),
                    Err(e) => Some(Err(Error::connection(format!("SSE transport: {e}")))),
                }
            });

        Ok(Box::pin(events))
    }

    async fn count_tokens(&self, request: &ProviderRequest) -> Result<Option<u64>> {
        let mut counted = request.clone();
        counted.messages = filter_messages_for_token_count(&request.messages);

        let response = self
            .request_builder("/v1/messages/count_tokens", &counted)
            .json(&self.payload(&counted, false))
            .send()
            .await;

        // Best effort: any failure degrades to "unknown" instead of erroring.
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                log::warn!("count_tokens returned HTTP {}", r.status());
                return Ok(None);
            }
            Err(e) => {
                log::warn!("count_tokens request failed: {e}");
                return Ok(None);
            }
        };

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("count_tokens body unreadable: {e}");
                return Ok(None);
            }
        };

        Ok(body.get("input_tokens").and_then(Value::as_u64))
    }
}

/// Parse one SSE `data:` payload into a [`StreamEvent`].
///
/// Returns `None` for unknown event types (skipped, per the provider's
/// versioning policy) and for empty keep-alive payloads.
fn parse_sse_data(data: &str) -> Option<Result<StreamEvent>> {
    if data.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(Error::unknown(format!("unparseable event: {e}")))),
    };
    match serde_json::from_value::<StreamEvent>(value.clone()) {
        Ok(event) => Some(Ok(event)),
        Err(_) => {
            log::debug!(
                "skipping unrecognized stream event type: {}",
                value.get("type").and_then(Value::as_str).unwrap_or("?")
            );
            None
        }
    }
}

/// Remove content the token-count endpoint rejects (URL-sourced documents).
pub fn filter_messages_for_token_count(messages: &[Message]) -> Vec<Message> {
    use crate::types::{ContentBlock, MediaSource};

    messages
        .iter()
        .filter_map(|msg| {
            let content: Vec<ContentBlock> = msg
                .content
                .iter()
                .filter(|block| {
                    !matches!(
                        block,
                        ContentBlock::Document(doc) if matches!(doc.source, MediaSource::Url { .. })
                    )
                })
                .cloned()
                .collect();
            if content.is_empty() {
                None
            } else {
                Some(Message::new(msg.role, content))
            }
        })
        .collect()
}
