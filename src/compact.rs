//! Context compaction: token estimation and history-shrinking strategies.
//!
//! Token budgeting is heuristic. Text costs about one token per four
//! characters; images cost `ceil(w·h / 750)` after the provider's documented
//! auto-resize (long edge capped at 1568 px, pixel count capped at
//! 1600·750); PDFs cost about 2000 tokens per page. The agent invokes the
//! configured [`Compactor`] whenever the estimate for the next request
//! exceeds the model's budget (roughly 80% of its context window).
//!
//! Compaction is a function of history only, never of the in-flight
//! response, and a compactor never increases the estimate and never
//! reorders the messages it keeps.

use crate::config::{CompactorKind, FormatterKind};
use crate::error::Result;
use crate::provider::{ProviderClient, ProviderRequest};
use crate::streaming::{format_stream, output_channel};
use crate::types::{ContentBlock, MediaSource, Message, TextBlock, ToolResultContent};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

// ── Model context-window budgets ────────────────────────────────────────
// Set at ~80% of each model's context window to leave room for output.

const MODEL_TOKEN_LIMITS: &[(&str, u64)] = &[
    ("claude-sonnet-4-5", 160_000),
    ("claude-sonnet-4", 160_000),
    ("claude-opus-4", 160_000),
    ("claude-haiku-4-5", 160_000),
    ("claude-3-7-sonnet", 160_000),
    ("claude-3-5-sonnet", 160_000),
    ("claude-3-5-haiku", 160_000),
];

/// Default budget for models not in the table.
pub const DEFAULT_TOKEN_LIMIT: u64 = 160_000;

/// Token budget for `model`: exact match first, then substring match so
/// versioned names ("claude-sonnet-4-5-20250929") resolve to their base.
pub fn model_token_limit(model: &str) -> u64 {
    let lowered = model.to_lowercase();
    for (key, limit) in MODEL_TOKEN_LIMITS {
        if *key == model {
            return *limit;
        }
        if lowered.contains(key) {
            return *limit;
        }
    }
    DEFAULT_TOKEN_LIMIT
}

// ── Image token heuristic ───────────────────────────────────────────────

/// Maximum long edge after the provider's auto-resize.
pub const MAX_LONG_EDGE: u32 = 1568;
/// Worst-case token cost of a single image.
pub const MAX_IMAGE_TOKENS: u64 = 1600;
/// Pixels per token.
pub const TOKEN_DIVISOR: u64 = 750;

/// Estimate tokens for an image of `width` x `height` pixels, simulating
/// the provider's auto-resize before applying `ceil(w·h / 750)`.
pub fn estimate_image_tokens(width: u32, height: u32) -> u64 {
    let (mut w, mut h) = (width as f64, height as f64);

    let long_edge = w.max(h);
    if long_edge > MAX_LONG_EDGE as f64 {
        let scale = MAX_LONG_EDGE as f64 / long_edge;
        w = (w * scale).floor();
        h = (h * scale).floor();
    }

    let max_pixels = (MAX_IMAGE_TOKENS * TOKEN_DIVISOR) as f64;
    if w * h > max_pixels {
        let scale = (max_pixels / (w * h)).sqrt();
        w = (w * scale).floor();
        h = (h * scale).floor();
    }

    ((w * h) / TOKEN_DIVISOR as f64).ceil() as u64
}

// ── PDF token heuristic ─────────────────────────────────────────────────

/// Cost per PDF page: midpoint of the documented 1500-3000 range.
pub const TOKENS_PER_PDF_PAGE: u64 = 2000;

/// Estimate tokens for a PDF with `pages` pages.
pub fn estimate_pdf_tokens(pages: u64) -> u64 {
    pages * TOKENS_PER_PDF_PAGE
}

/// Count pages in raw PDF bytes by scanning for page-object markers.
/// Returns at least 1 for anything that looks like a document at all.
pub fn count_pdf_pages(bytes: &[u8]) -> u64 {
    let mut count = 0u64;
    let needle = b"/Type";
    let mut i = 0;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            let mut j = i + needle.len();
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if bytes[j..].starts_with(b"/Page")
                && !bytes[j..].starts_with(b"/Pages")
            {
                count += 1;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    count.max(1)
}

// ── Message estimation ──────────────────────────────────────────────────

fn chars_to_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

fn estimate_media_tokens(source: &MediaSource, is_document: bool) -> u64 {
    match source {
        MediaSource::Base64 { data, .. } if is_document => {
            match base64::engine::general_purpose::STANDARD.decode(data) {
                Ok(bytes) => estimate_pdf_tokens(count_pdf_pages(&bytes)),
                Err(_) => TOKENS_PER_PDF_PAGE,
            }
        }
        MediaSource::Url { .. } if is_document => TOKENS_PER_PDF_PAGE,
        // Opaque image payloads carry no dimensions; charge the documented
        // worst case rather than decoding pixels.
        _ => MAX_IMAGE_TOKENS,
    }
}

fn estimate_block_tokens(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text(t) => chars_to_tokens(t.text.len()),
        ContentBlock::Thinking(t) => {
            chars_to_tokens(t.thinking.len())
                + chars_to_tokens(t.signature.as_deref().map_or(0, str::len))
        }
        ContentBlock::ToolUse(t) | ContentBlock::ServerToolUse(t) => {
            chars_to_tokens(t.name.len() + t.id.len() + t.input.to_string().len())
        }
        ContentBlock::ToolResult(t) => {
            let content_tokens = match &t.content {
                ToolResultContent::Text(s) => chars_to_tokens(s.len()),
                ToolResultContent::Blocks(blocks) => {
                    blocks.iter().map(estimate_block_tokens).sum()
                }
            };
            chars_to_tokens(t.tool_use_id.len()) + content_tokens
        }
        ContentBlock::Image(i) => estimate_media_tokens(&i.source, false),
        ContentBlock::Document(d) => estimate_media_tokens(&d.source, true),
        ContentBlock::ServerToolResult(r) => {
            chars_to_tokens(r.tool_use_id.len() + r.content.to_string().len())
        }
    }
}

/// Estimate the token count of a message list.
///
/// Monotonic: adding a message never decreases the estimate.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|msg| 2 + msg.content.iter().map(estimate_block_tokens).sum::<u64>())
        .sum()
}

/// Estimate the full request: history plus system prompt plus tool schemas.
pub fn estimate_request_tokens(messages: &[Message], system: Option<&str>, tools: &[Value]) -> u64 {
    let system_tokens = chars_to_tokens(system.map_or(0, str::len));
    let tool_tokens: u64 = tools
        .iter()
        .map(|t| chars_to_tokens(t.to_string().len()))
        .sum();
    estimate_tokens(messages) + system_tokens + tool_tokens
}

// ── Compactor contract ──────────────────────────────────────────────────

/// Inputs a compactor may consult besides the history itself.
#[derive(Debug, Clone, Copy)]
pub struct CompactionContext<'a> {
    pub system: Option<&'a str>,
    pub tools: &'a [Value],
    pub model: &'a str,
    /// Token budget the result should fit under
    pub budget: u64,
}

/// What a compaction pass did, recorded in the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionInfo {
    pub strategy: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
    #[serde(default)]
    pub messages_removed: usize,
    #[serde(default)]
    pub tool_results_replaced: usize,
}

/// A pluggable history-shrinking strategy.
#[async_trait]
pub trait Compactor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shrink `history` toward the budget. Must not reorder kept messages
    /// and must not increase the token estimate.
    async fn compact(
        &self,
        history: Vec<Message>,
        ctx: &CompactionContext<'_>,
    ) -> Result<(Vec<Message>, CompactionInfo)>;
}

/// Build the compactor selected by an agent config. The provider client is
/// only used by the summarizing strategy.
pub fn compactor_for(
    kind: CompactorKind,
    client: Option<Arc<dyn ProviderClient>>,
) -> Box<dyn Compactor> {
    match kind {
        CompactorKind::None => Box::new(NoOpCompactor),
        CompactorKind::ToolResultRemoval => Box::new(ToolResultRemovalCompactor::default()),
        CompactorKind::SlidingWindow => Box::new(SlidingWindowCompactor::default()),
        CompactorKind::Summarizing => Box::new(SummarizingCompactor::new(client)),
    }
}

// ── Strategies ──────────────────────────────────────────────────────────

/// Placeholder body left behind when a tool result is elided.
pub const TOOL_RESULT_PLACEHOLDER: &str = "[older tool result elided]";

fn info(
    strategy: &str,
    before: &[Message],
    after: &[Message],
    ctx: &CompactionContext<'_>,
    messages_removed: usize,
    tool_results_replaced: usize,
) -> CompactionInfo {
    CompactionInfo {
        strategy: strategy.to_string(),
        tokens_before: estimate_request_tokens(before, ctx.system, ctx.tools),
        tokens_after: estimate_request_tokens(after, ctx.system, ctx.tools),
        messages_removed,
        tool_results_replaced,
    }
}

/// Identity: never shrinks.
pub struct NoOpCompactor;

#[async_trait]
impl Compactor for NoOpCompactor {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn compact(
        &self,
        history: Vec<Message>,
        ctx: &CompactionContext<'_>,
    ) -> Result<(Vec<Message>, CompactionInfo)> {
        let stats = info("none", &history, &history, ctx, 0, 0);
        Ok((history, stats))
    }
}

/// Replace the body of tool_result blocks outside the most recent messages
/// with a short placeholder, preserving `tool_use_id`. The most aggressive
/// lossy strategy and the simplest: message count never changes.
pub struct ToolResultRemovalCompactor {
    /// How many trailing messages keep their tool results intact
    pub keep_recent: usize,
}

impl Default for ToolResultRemovalCompactor {
    fn default() -> Self {
        Self { keep_recent: 4 }
    }
}

/// Replace tool_result bodies in `messages[..boundary]`; returns how many
/// were replaced.
fn elide_tool_results(messages: &mut [Message], boundary: usize) -> usize {
    let mut replaced = 0;
    for msg in messages.iter_mut().take(boundary) {
        for block in &mut msg.content {
            if let ContentBlock::ToolResult(result) = block {
                if result.content != ToolResultContent::Text(TOOL_RESULT_PLACEHOLDER.to_string()) {
                    result.content = ToolResultContent::Text(TOOL_RESULT_PLACEHOLDER.to_string());
                    replaced += 1;
                }
            }
        }
    }
    replaced
}

#[async_trait]
impl Compactor for ToolResultRemovalCompactor {
    fn name(&self) -> &'static str {
        "tool_result_removal"
    }

    async fn compact(
        &self,
        history: Vec<Message>,
        ctx: &CompactionContext<'_>,
    ) -> Result<(Vec<Message>, CompactionInfo)> {
        let before = history.clone();
        let mut compacted = history;
        let boundary = compacted.len().saturating_sub(self.keep_recent);
        let replaced = elide_tool_results(&mut compacted, boundary);
        let stats = info(self.name(), &before, &compacted, ctx, 0, replaced);
        Ok((compacted, stats))
    }
}

/// Find a cut index at or before `ideal` where the kept window does not
/// open with orphan tool results (every tool_result must keep its earlier
/// tool_use in history).
fn safe_cut(history: &[Message], ideal: usize) -> usize {
    let mut cut = ideal.min(history.len().saturating_sub(1));
    while cut > 0
        && history[cut]
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult(_)))
    {
        cut -= 1;
    }
    cut
}

/// Keep the last N messages behind a textual truncation marker. When the
/// cut alone is not enough, older tool results inside the kept window are
/// elided too.
pub struct SlidingWindowCompactor {
    /// How many trailing messages to keep
    pub keep_messages: usize,
    /// How many of those keep their tool results intact
    pub keep_recent_results: usize,
}

impl Default for SlidingWindowCompactor {
    fn default() -> Self {
        Self {
            keep_messages: 10,
            keep_recent_results: 2,
        }
    }
}

#[async_trait]
impl Compactor for SlidingWindowCompactor {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn compact(
        &self,
        history: Vec<Message>,
        ctx: &CompactionContext<'_>,
    ) -> Result<(Vec<Message>, CompactionInfo)> {
        let before = history.clone();
        let cut = safe_cut(&history, history.len().saturating_sub(self.keep_messages));

        let mut compacted: Vec<Message> = Vec::with_capacity(history.len() - cut + 1);
        if cut > 0 {
            compacted.push(Message::user(format!(
                "[Conversation truncated: {cut} earlier messages removed]"
            )));
        }
        compacted.extend(history.into_iter().skip(cut));

        let mut replaced = 0;
        if estimate_request_tokens(&compacted, ctx.system, ctx.tools) > ctx.budget {
            let boundary = compacted.len().saturating_sub(self.keep_recent_results);
            replaced = elide_tool_results(&mut compacted, boundary);
        }

        let stats = info(self.name(), &before, &compacted, ctx, cut, replaced);
        Ok((compacted, stats))
    }
}

/// Offload older messages to a summarization call and replace them with a
/// single synopsis block. Falls back to the truncation marker when no
/// client is available.
pub struct SummarizingCompactor {
    client: Option<Arc<dyn ProviderClient>>,
    pub keep_messages: usize,
    /// Output cap for the summary response
    pub summary_max_tokens: u32,
}

impl SummarizingCompactor {
    pub fn new(client: Option<Arc<dyn ProviderClient>>) -> Self {
        Self {
            client,
            keep_messages: 10,
            summary_max_tokens: 1024,
        }
    }

    /// Flatten messages into a plain-text transcript for the summarizer.
    fn transcript(messages: &[Message]) -> String {
        let mut out = String::new();
        for msg in messages {
            let role = match msg.role {
                crate::types::Role::User => "user",
                crate::types::Role::Assistant => "assistant",
            };
            for block in &msg.content {
                match block {
                    ContentBlock::Text(t) => {
                        out.push_str(&format!("{role}: {}\n", t.text));
                    }
                    ContentBlock::ToolUse(t) => {
                        out.push_str(&format!("{role} called tool {}({})\n", t.name, t.input));
                    }
                    ContentBlock::ToolResult(t) => {
                        out.push_str(&format!("tool result: {}\n", t.content.to_text()));
                    }
                    _ => {}
                }
            }
        }
        out
    }
}

#[async_trait]
impl Compactor for SummarizingCompactor {
    fn name(&self) -> &'static str {
        "summarizing"
    }

    async fn compact(
        &self,
        history: Vec<Message>,
        ctx: &CompactionContext<'_>,
    ) -> Result<(Vec<Message>, CompactionInfo)> {
        let before = history.clone();
        let cut = safe_cut(&history, history.len().saturating_sub(self.keep_messages));
        if cut == 0 {
            let stats = info(self.name(), &before, &history, ctx, 0, 0);
            return Ok((history, stats));
        }

        let synopsis = match &self.client {
            Some(client) => {
                let request = ProviderRequest {
                    model: ctx.model.to_string(),
                    messages: vec![Message::user(format!(
                        "Summarize the following conversation so it can stand in for \
                         the original messages. Keep decisions, facts, and open tasks.\n\n{}",
                        Self::transcript(&history[..cut])
                    ))],
                    system: None,
                    tools: Vec::new(),
                    max_tokens: self.summary_max_tokens,
                    beta_headers: Vec::new(),
                    extra_options: serde_json::Map::new(),
                };
                // The summary stream has no consumer; drop the receiver and
                // let the formatter assemble the message.
                let (tx, rx) = output_channel();
                drop(rx);
                let events = client.stream(&request).await?;
                let message = format_stream(FormatterKind::Xml, events, &tx).await?;
                message.text()
            }
            None => format!("{cut} earlier messages removed"),
        };

        let mut compacted = Vec::with_capacity(history.len() - cut + 1);
        compacted.push(Message::user_blocks(vec![ContentBlock::Text(
            TextBlock::new(format!("[Summary of earlier conversation]\n{synopsis}")),
        )]));
        compacted.extend(history.into_iter().skip(cut));

        let stats = info(self.name(), &before, &compacted, ctx, cut, 0);
        Ok((compacted, stats))
    }
}
