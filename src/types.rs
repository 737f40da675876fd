//! Core type definitions for the relay agent SDK.
//!
//! The message model is a closed tagged union over the content-block types
//! the provider wire protocol can carry:
//!
//! - [`TextBlock`]: plain assistant/user text
//! - [`ThinkingBlock`]: extended-thinking text plus its signature
//! - [`ToolUseBlock`]: the model's request to invoke a named tool
//! - [`ToolResultBlock`]: the captured outcome of a tool invocation
//! - [`ImageBlock`] / [`DocumentBlock`]: binary payloads (base64 or URL)
//! - server-tool variants for tools the provider executes itself
//!
//! Everything here derives `Serialize`/`Deserialize` so the same types serve
//! three masters: the provider request payload, the durable conversation
//! snapshot, and the checkpointed relay state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// ROLES AND MESSAGES
// ============================================================================

/// Who authored a message.
///
/// The provider protocol only knows `user` and `assistant`; system prompts
/// travel in a dedicated request field, and tool results are carried inside
/// `user` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single conversation message: a role plus an ordered list of content
/// blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,
    /// Ordered content blocks
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Create a message with an explicit role and content blocks.
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    /// Create a user message with a single text block.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text(TextBlock::new(text))],
        }
    }

    /// Create a user message from pre-built content blocks (used for tool
    /// results, which the wire protocol carries under the user role).
    pub fn user_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    /// Create an assistant message from content blocks.
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Concatenated text of all `text` blocks in this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All `tool_use` blocks in this message, in order.
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(t) => Some(t),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// CONTENT BLOCKS
// ============================================================================

/// One item of message content.
///
/// Tagged on the wire with a `type` field, matching the provider protocol.
/// Server-side tool blocks (`server_tool_use` / `server_tool_result`) are
/// produced by the provider when it executes tools itself (web search, code
/// execution); the agent never dispatches them but keeps them in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    Thinking(ThinkingBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    Image(ImageBlock),
    Document(DocumentBlock),
    ServerToolUse(ToolUseBlock),
    ServerToolResult(ServerToolResultBlock),
}

/// Plain text content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Extended-thinking content. The signature is opaque provider state that
/// must be echoed back verbatim on subsequent requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The model's request to invoke a named tool with structured input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Provider-assigned identifier, referenced by the matching tool_result
    pub id: String,
    /// Registered tool name
    pub name: String,
    /// Structured input matching the tool's JSON schema
    pub input: Value,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The captured outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// Which tool_use this result answers
    pub tool_use_id: String,
    /// Result payload: plain text or a list of content blocks
    pub content: ToolResultContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResultBlock {
    /// Successful text result.
    pub fn text(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: ToolResultContent::Text(content.into()),
            is_error: None,
        }
    }

    /// Error result with a short diagnostic string.
    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: ToolResultContent::Text(message.into()),
            is_error: Some(true),
        }
    }

    /// Multimodal result with pre-built content blocks.
    pub fn blocks(tool_use_id: impl Into<String>, blocks: Vec<ContentBlock>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: ToolResultContent::Blocks(blocks),
            is_error: None,
        }
    }
}

/// Tool result payload: the wire protocol accepts either a bare string or a
/// list of content blocks (for multimodal results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    /// Flattened text rendering, used for streaming and run logs.
    pub fn to_text(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text(t) => Some(t.text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Image content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    pub source: MediaSource,
}

impl ImageBlock {
    /// Build an image block from raw bytes, base64-encoding the payload.
    pub fn from_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        use base64::Engine;
        Self {
            source: MediaSource::Base64 {
                media_type: media_type.into(),
                data: base64::engine::general_purpose::STANDARD.encode(data),
            },
        }
    }
}

/// Document content (PDFs and friends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBlock {
    pub source: MediaSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Binary payload source: inline base64 or an external URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// Result block for a tool the provider executed server-side.
///
/// `block_type` preserves the provider's concrete wire name (for example
/// `web_search_tool_result`) so nothing is lost when the block is kept in
/// history; `content` stays opaque JSON because its shape varies per tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerToolResultBlock {
    pub tool_use_id: String,
    pub block_type: String,
    pub content: Value,
}

// ============================================================================
// STOP REASONS AND USAGE
// ============================================================================

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    StopSequence,
    MaxTokens,
    ToolUse,
    Refusal,
    #[serde(other)]
    Unknown,
}

impl StopReason {
    /// Stable lowercase name used in run logs and conversation records.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::StopSequence => "stop_sequence",
            StopReason::MaxTokens => "max_tokens",
            StopReason::ToolUse => "tool_use",
            StopReason::Refusal => "refusal",
            StopReason::Unknown => "unknown",
        }
    }
}

/// Token usage reported by the provider for one request.
///
/// The cache counters are a subset of `input_tokens` by provider contract;
/// cost calculation relies on that to avoid double counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Merge a usage delta into this total. `message_delta` events carry
    /// cumulative output counts, so output is replaced rather than summed.
    pub fn absorb(&mut self, other: &Usage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
        if other.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
    }
}

/// Usage attributed to one step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUsage {
    pub step: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl StepUsage {
    pub fn from_usage(step: u32, usage: &Usage) -> Self {
        Self {
            step,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
        }
    }
}

// ============================================================================
// ASSEMBLED PROVIDER MESSAGE
// ============================================================================

/// The final message assembled from a completed provider stream: content
/// blocks in order plus terminal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl ProviderMessage {
    /// Convert into a history message (assistant role, same blocks).
    pub fn into_message(self) -> Message {
        Message::assistant(self.content)
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All client tool_use blocks (excludes server-side tool use).
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(t) => Some(t),
                _ => None,
            })
            .collect()
    }
}

/// Reference to a stored multimodal artifact, relayed to stream consumers
/// in place of the base64 payload the API sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Stable identifier assigned when the artifact was stored
    pub image_id: String,
    /// Opaque location: an API path for local backends, a URL otherwise
    pub src: String,
    /// MIME type of the artifact
    pub media_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "hello");

        let msg = Message::assistant(vec![
            ContentBlock::Text(TextBlock::new("a")),
            ContentBlock::Text(TextBlock::new("b")),
        ]);
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn test_content_block_wire_tags() {
        let block = ContentBlock::Text(TextBlock::new("hi"));
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["text"], "hi");

        let block = ContentBlock::ToolUse(ToolUseBlock::new("t1", "add", json!({"a": 1})));
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["name"], "add");

        let block = ContentBlock::ServerToolUse(ToolUseBlock::new("s1", "web_search", json!({})));
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "server_tool_use");
    }

    #[test]
    fn test_tool_result_content_untagged() {
        let text = ToolResultBlock::text("t1", "5");
        let v = serde_json::to_value(&text).unwrap();
        assert_eq!(v["content"], "5");

        let multi = ToolResultBlock::blocks(
            "t2",
            vec![ContentBlock::Text(TextBlock::new("see image"))],
        );
        let v = serde_json::to_value(&multi).unwrap();
        assert!(v["content"].is_array());

        // Round-trip both shapes
        let back: ToolResultBlock = serde_json::from_value(serde_json::to_value(&text).unwrap()).unwrap();
        assert_eq!(back, text);
        let back: ToolResultBlock = serde_json::from_value(serde_json::to_value(&multi).unwrap()).unwrap();
        assert_eq!(back, multi);
    }

    #[test]
    fn test_tool_result_error_flag() {
        let err = ToolResultBlock::error("t1", "boom");
        assert_eq!(err.is_error, Some(true));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["is_error"], true);

        let ok = ToolResultBlock::text("t1", "fine");
        let v = serde_json::to_value(&ok).unwrap();
        assert!(v.get("is_error").is_none());
    }

    #[test]
    fn test_stop_reason_parsing() {
        let r: StopReason = serde_json::from_value(json!("end_turn")).unwrap();
        assert_eq!(r, StopReason::EndTurn);
        let r: StopReason = serde_json::from_value(json!("tool_use")).unwrap();
        assert_eq!(r, StopReason::ToolUse);
        // Unrecognized reasons degrade instead of failing the stream
        let r: StopReason = serde_json::from_value(json!("pause_turn")).unwrap();
        assert_eq!(r, StopReason::Unknown);
    }

    #[test]
    fn test_usage_absorb_replaces_output() {
        let mut total = Usage {
            input_tokens: 100,
            output_tokens: 5,
            ..Default::default()
        };
        total.absorb(&Usage {
            output_tokens: 42,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 100);
        assert_eq!(total.output_tokens, 42);
    }

    #[test]
    fn test_image_block_from_bytes() {
        let block = ImageBlock::from_bytes("image/png", &[1, 2, 3]);
        match &block.source {
            MediaSource::Base64 { media_type, data } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "AQID");
            }
            _ => panic!("expected base64 source"),
        }
    }

    #[test]
    fn test_provider_message_helpers() {
        let msg = ProviderMessage {
            id: "msg_1".into(),
            model: "claude-sonnet-4-5".into(),
            content: vec![
                ContentBlock::Text(TextBlock::new("before ")),
                ContentBlock::ToolUse(ToolUseBlock::new("t1", "add", json!({"a": 2, "b": 3}))),
                ContentBlock::ServerToolUse(ToolUseBlock::new("s1", "web_search", json!({}))),
            ],
            stop_reason: Some(StopReason::ToolUse),
            stop_sequence: None,
            usage: Usage::default(),
        };
        assert_eq!(msg.text(), "before ");
        // Server tool use is not dispatched by the agent
        assert_eq!(msg.tool_uses().len(), 1);
        assert_eq!(msg.tool_uses()[0].name, "add");
    }

    #[test]
    fn test_message_round_trip() {
        let msg = Message::user_blocks(vec![
            ContentBlock::ToolResult(ToolResultBlock::text("t1", "5")),
            ContentBlock::Image(ImageBlock::from_bytes("image/png", b"xyz")),
        ]);
        let v = serde_json::to_value(&msg).unwrap();
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }
}
