//! Stream formatters: provider events in, normalized chunks out.
//!
//! A formatter consumes the provider's [`StreamEvent`] sequence, writes
//! normalized chunks to a bounded output channel as they become available,
//! and returns the final assembled [`ProviderMessage`] for history. Two
//! shapes are supported:
//!
//! - **Xml** — delimited blocks with stable tag names. Text and thinking
//!   content stream character-incrementally between open/close tags; tool
//!   calls are buffered until their argument JSON is complete and then
//!   emitted once with attributes; tool results wrap their payload in a
//!   CDATA section.
//! - **Raw** — every provider event re-serialized as one JSON frame, in
//!   event order, for consumers that want exact fidelity.
//!
//! Contracts:
//!
//! 1. Every opened tag is closed before the stream ends, even on abnormal
//!    provider termination (a cleanup pass runs before the error
//!    propagates).
//! 2. Every attribute value is XML-escaped; user text never lands in an
//!    attribute unescaped.
//! 3. Deltas are forwarded in arrival order, never reordered or coalesced
//!    across block boundaries.
//! 4. The final assembled message is returned in addition to the chunks.
//!
//! The output channel is bounded (capacity [`OUTPUT_CHANNEL_CAPACITY`]) so a
//! slow consumer back-pressures the formatter and, through it, the upstream
//! event loop. A dropped receiver does not abort the stream: the formatter
//! keeps consuming so the final message can still be assembled and
//! persisted.

use crate::config::{FormatterKind, PendingFrontendTool};
use crate::error::Result;
use crate::provider::{Delta, EventStream, StreamEvent};
use crate::types::{
    ContentBlock, ProviderMessage, ServerToolResultBlock, StopReason, TextBlock, ThinkingBlock,
    ToolUseBlock, Usage,
};
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Capacity of the output chunk channel. Deliberately small: back-pressure
/// is the flow-control mechanism, an unbounded queue would let a fast
/// provider outrun a slow consumer unnoticed.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Sending half of the output chunk channel.
pub type OutputSender = mpsc::Sender<String>;
/// Receiving half of the output chunk channel.
pub type OutputReceiver = mpsc::Receiver<String>;

/// Create a bounded output channel with the standard capacity.
pub fn output_channel() -> (OutputSender, OutputReceiver) {
    mpsc::channel(OUTPUT_CHANNEL_CAPACITY)
}

/// Escape a string for safe use as an XML attribute value.
pub fn escape_xml_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

/// Send one chunk, honoring back-pressure. A closed channel (consumer gone)
/// is not an error: the stream still has to finish so the final message can
/// be assembled and checkpointed.
async fn send_chunk(tx: &OutputSender, chunk: String) {
    let _ = tx.send(chunk).await;
}

// ============================================================================
// AGENT-LEVEL CHUNKS
// ============================================================================

/// The `meta_init` chunk that opens every step's output.
pub fn meta_init_chunk(kind: FormatterKind, meta: &Value) -> String {
    match kind {
        FormatterKind::Xml => format!(
            "<meta_init data=\"{}\"></meta_init>",
            escape_xml_attr(&meta.to_string())
        ),
        FormatterKind::Raw => format!("{}\n", json!({"type": "meta_init", "data": meta})),
    }
}

/// A backend tool result relayed to the consumer. The body is opaque: plain
/// text, or a JSON object when image references ride along.
pub fn tool_result_chunk(kind: FormatterKind, tool_use_id: &str, name: &str, body: &str) -> String {
    match kind {
        FormatterKind::Xml => format!(
            "<content-block-tool_result id=\"{}\" name=\"{}\"><![CDATA[{}]]></content-block-tool_result>",
            escape_xml_attr(tool_use_id),
            escape_xml_attr(name),
            body
        ),
        FormatterKind::Raw => format!(
            "{}\n",
            json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "name": name,
                "content": body
            })
        ),
    }
}

/// The terminal marker emitted when the agent pauses for frontend tools.
pub fn awaiting_frontend_tools_chunk(kind: FormatterKind, pending: &[PendingFrontendTool]) -> String {
    let data = serde_json::to_value(pending).unwrap_or_else(|_| json!([]));
    match kind {
        FormatterKind::Xml => format!(
            "<awaiting_frontend_tools data=\"{}\"></awaiting_frontend_tools>",
            escape_xml_attr(&data.to_string())
        ),
        FormatterKind::Raw => format!(
            "{}\n",
            json!({"type": "awaiting_frontend_tools", "pending": data})
        ),
    }
}

/// An error surfaced on the output channel.
pub fn error_chunk(kind: FormatterKind, body: &str) -> String {
    match kind {
        FormatterKind::Xml => format!(
            "<content-block-error><![CDATA[{body}]]></content-block-error>"
        ),
        FormatterKind::Raw => format!("{}\n", json!({"type": "error", "error": body})),
    }
}

// ============================================================================
// MESSAGE ACCUMULATION
// ============================================================================

/// A content block being assembled from deltas, tracked by stream index.
#[derive(Debug, Default)]
struct BlockBuilder {
    block_type: String,
    text: String,
    thinking: String,
    signature: Option<String>,
    tool_id: String,
    tool_name: String,
    input_json: String,
    result_tool_use_id: String,
    result_content: Option<Value>,
    /// An open xml tag is pending its close
    is_open: bool,
}

impl BlockBuilder {
    fn finish(self) -> Option<ContentBlock> {
        match self.block_type.as_str() {
            "text" => Some(ContentBlock::Text(TextBlock::new(self.text))),
            "thinking" => Some(ContentBlock::Thinking(ThinkingBlock {
                thinking: self.thinking,
                signature: self.signature,
            })),
            "tool_use" => Some(ContentBlock::ToolUse(ToolUseBlock::new(
                self.tool_id,
                self.tool_name,
                parse_tool_input(&self.input_json),
            ))),
            "server_tool_use" => Some(ContentBlock::ServerToolUse(ToolUseBlock::new(
                self.tool_id,
                self.tool_name,
                parse_tool_input(&self.input_json),
            ))),
            other if other.ends_with("_tool_result") => {
                Some(ContentBlock::ServerToolResult(ServerToolResultBlock {
                    tool_use_id: self.result_tool_use_id,
                    block_type: self.block_type,
                    content: self.result_content.unwrap_or(Value::Null),
                }))
            }
            _ => None,
        }
    }
}

/// Parse accumulated argument JSON; an empty buffer means no arguments, and
/// malformed JSON is preserved as a string rather than dropped.
fn parse_tool_input(raw: &str) -> Value {
    if raw.is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Accumulates provider events into the final [`ProviderMessage`]. Shared by
/// both formatters; the xml path layers chunk emission on top.
#[derive(Debug, Default)]
struct MessageAccumulator {
    id: String,
    model: String,
    usage: Usage,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    blocks: BTreeMap<usize, BlockBuilder>,
}

impl MessageAccumulator {
    /// Fold one event into the accumulated message state.
    fn absorb(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                self.model = message.model.clone();
                self.usage.absorb(&message.usage);
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence.clone();
                }
                self.usage.absorb(usage);
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let builder = BlockBuilder {
                    block_type: content_block.block_type.clone(),
                    text: content_block.text.clone().unwrap_or_default(),
                    thinking: content_block.thinking.clone().unwrap_or_default(),
                    tool_id: content_block.id.clone().unwrap_or_default(),
                    tool_name: content_block.name.clone().unwrap_or_default(),
                    result_tool_use_id: content_block.tool_use_id.clone().unwrap_or_default(),
                    result_content: content_block.content.clone(),
                    ..Default::default()
                };
                self.blocks.insert(*index, builder);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                if let Some(builder) = self.blocks.get_mut(index) {
                    match delta {
                        Delta::TextDelta { text } => builder.text.push_str(text),
                        Delta::ThinkingDelta { thinking } => builder.thinking.push_str(thinking),
                        Delta::SignatureDelta { signature } => {
                            builder.signature = Some(signature.clone())
                        }
                        Delta::InputJsonDelta { partial_json } => {
                            builder.input_json.push_str(partial_json)
                        }
                    }
                }
            }
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => {}
        }
    }

    fn finish(self) -> ProviderMessage {
        ProviderMessage {
            id: self.id,
            model: self.model,
            content: self
                .blocks
                .into_values()
                .filter_map(BlockBuilder::finish)
                .collect(),
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence,
            usage: self.usage,
        }
    }
}

// ============================================================================
// FORMATTERS
// ============================================================================

/// Run the selected formatter over a provider event stream.
///
/// Chunks flow to `tx` as they are produced; the assembled message is
/// returned when the stream ends. On a transport error the cleanup pass
/// closes any open tags before the error propagates to the caller (the
/// retry driver).
pub async fn format_stream(
    kind: FormatterKind,
    events: EventStream,
    tx: &OutputSender,
) -> Result<ProviderMessage> {
    match kind {
        FormatterKind::Xml => xml_format(events, tx).await,
        FormatterKind::Raw => raw_format(events, tx).await,
    }
}

async fn xml_format(mut events: EventStream, tx: &OutputSender) -> Result<ProviderMessage> {
    let mut acc = MessageAccumulator::default();

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                close_open_tags(&mut acc, tx).await;
                return Err(e);
            }
        };

        acc.absorb(&event);

        match &event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block.block_type.as_str() {
                "thinking" => {
                    send_chunk(tx, "<content-block-thinking>".to_string()).await;
                    if let Some(b) = acc.blocks.get_mut(index) {
                        b.is_open = true;
                    }
                }
                "text" => {
                    send_chunk(tx, "<content-block-text>".to_string()).await;
                    if let Some(b) = acc.blocks.get_mut(index) {
                        b.is_open = true;
                    }
                }
                // Tool calls and server tool results are buffered and
                // emitted whole on content_block_stop.
                _ => {}
            },
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                Delta::TextDelta { text } if !text.is_empty() => {
                    send_chunk(tx, text.clone()).await;
                }
                Delta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    send_chunk(tx, thinking.clone()).await;
                }
                _ => {}
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some(builder) = acc.blocks.get_mut(index) {
                    if builder.is_open {
                        match builder.block_type.as_str() {
                            "thinking" => {
                                send_chunk(tx, "</content-block-thinking>".to_string()).await
                            }
                            "text" => send_chunk(tx, "</content-block-text>".to_string()).await,
                            _ => {}
                        }
                        builder.is_open = false;
                    } else {
                        let chunk = buffered_block_chunk(builder);
                        if let Some(chunk) = chunk {
                            send_chunk(tx, chunk).await;
                        }
                    }
                }
            }
            StreamEvent::Error { error } => {
                send_chunk(
                    tx,
                    format!("<content-block-error><![CDATA[{error}]]></content-block-error>"),
                )
                .await;
            }
            _ => {}
        }
    }

    close_open_tags(&mut acc, tx).await;
    Ok(acc.finish())
}

/// Emit a buffered tool_call / server_tool_call / server_tool_result block
/// as a single chunk with escaped attributes.
fn buffered_block_chunk(builder: &BlockBuilder) -> Option<String> {
    match builder.block_type.as_str() {
        "tool_use" | "server_tool_use" => {
            let tag = if builder.block_type == "tool_use" {
                "tool_call"
            } else {
                "server_tool_call"
            };
            let arguments = parse_tool_input(&builder.input_json).to_string();
            Some(format!(
                "<content-block-{tag} id=\"{}\" name=\"{}\" arguments=\"{}\"></content-block-{tag}>",
                escape_xml_attr(&builder.tool_id),
                escape_xml_attr(&builder.tool_name),
                escape_xml_attr(&arguments),
            ))
        }
        other if other.ends_with("_tool_result") => {
            let content = match &builder.result_content {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
            };
            Some(format!(
                "<content-block-server_tool_result id=\"{}\" name=\"{}\"><![CDATA[{content}]]></content-block-server_tool_result>",
                escape_xml_attr(&builder.result_tool_use_id),
                escape_xml_attr(other),
            ))
        }
        _ => None,
    }
}

/// Cleanup pass: close any still-open text/thinking tags so consumers can
/// always rely on balanced tags.
async fn close_open_tags(acc: &mut MessageAccumulator, tx: &OutputSender) {
    for builder in acc.blocks.values_mut() {
        if builder.is_open {
            match builder.block_type.as_str() {
                "thinking" => send_chunk(tx, "</content-block-thinking>".to_string()).await,
                "text" => send_chunk(tx, "</content-block-text>".to_string()).await,
                _ => {}
            }
            builder.is_open = false;
        }
    }
}

async fn raw_format(mut events: EventStream, tx: &OutputSender) -> Result<ProviderMessage> {
    let mut acc = MessageAccumulator::default();

    while let Some(item) = events.next().await {
        let event = item?;
        acc.absorb(&event);
        match serde_json::to_string(&event) {
            Ok(frame) => send_chunk(tx, format!("{frame}\n")).await,
            Err(e) => log::warn!("failed to serialize stream event: {e}"),
        }
    }

    Ok(acc.finish())
}
