//! Durable agent configuration.
//!
//! [`AgentConfig`] is the checkpoint record for an agent: identity, model
//! settings, tool schemas, selector knobs for the pluggable pieces
//! (formatter, compactor, memory store), bookkeeping timestamps, and the
//! relay state that lets a paused run resume in a fresh process. The whole
//! struct round-trips through serde, so a config store can persist it
//! however it likes.
//!
//! Construction goes through [`AgentConfig::builder()`], which validates
//! required fields and fills documented defaults.

use crate::error::{Error, Result};
use crate::types::{Message, ToolResultBlock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default step budget per run.
pub const DEFAULT_MAX_STEPS: u32 = 10;
/// Default per-response output token cap.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
/// Default retry attempts for the streaming driver.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default base delay (seconds) for exponential backoff.
pub const DEFAULT_BASE_DELAY: f64 = 5.0;

/// Which stream formatter the agent writes to its output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatterKind {
    /// Delimited blocks with stable tag names (the default)
    #[default]
    Xml,
    /// One JSON-framed provider event per chunk
    Raw,
}

/// Which history-shrinking strategy the agent uses when over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactorKind {
    /// Identity: never shrink
    None,
    /// Replace old tool_result bodies with placeholders
    #[default]
    ToolResultRemoval,
    /// Keep the last N messages behind a summary marker
    SlidingWindow,
    /// Summarize older messages with a model call
    Summarizing,
}

/// Which cross-session memory store runs at run boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStoreKind {
    #[default]
    None,
    Placeholder,
}

/// A frontend tool call the agent is waiting on: enough to render a prompt
/// off-process and to validate the results handed back on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFrontendTool {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

/// Durable agent state.
///
/// Saved at the end of every step and whenever the agent pauses for
/// frontend tools; loading it into a fresh [`Agent`](crate::agent::Agent)
/// with the same `agent_uuid` restores the paused run exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identity, assigned once at creation and never changed
    pub agent_uuid: String,
    /// Provider model identifier (e.g. "claude-sonnet-4-5")
    pub model: String,
    /// System prompt, empty for none
    #[serde(default)]
    pub system_prompt: String,

    /// Backend tool schemas (native shape), for re-registering on rehydrate
    #[serde(default)]
    pub tool_schemas: Vec<Value>,
    /// Frontend tool schemas (native shape)
    #[serde(default)]
    pub frontend_tool_schemas: Vec<Value>,
    /// Server-side tool definitions passed through to the provider verbatim
    #[serde(default)]
    pub server_tools: Vec<Value>,
    /// Beta feature tags passed through to the provider verbatim
    #[serde(default)]
    pub beta_headers: Vec<String>,

    /// Step budget per run (≥ 1)
    pub max_steps: u32,
    /// Per-response output token cap
    pub max_tokens: u32,
    /// Thinking token budget; 0 disables thinking
    #[serde(default)]
    pub thinking_tokens: u32,
    /// Retry attempts for the streaming driver (≥ 1)
    pub max_retries: u32,
    /// Base delay in seconds for exponential backoff
    pub base_delay: f64,
    /// Context budget override in tokens; `None` uses the model's table
    /// entry (~80% of its context window)
    #[serde(default)]
    pub token_budget: Option<u64>,

    /// Output formatter selector
    #[serde(default)]
    pub formatter: FormatterKind,
    /// Compaction strategy selector
    #[serde(default)]
    pub compactor: CompactorKind,
    /// Memory store selector
    #[serde(default)]
    pub memory_store: MemoryStoreKind,

    /// Human-readable session title
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Completed run counter
    #[serde(default)]
    pub total_runs: u64,

    /// Input token count from the most recent step, for UIs
    #[serde(default)]
    pub last_known_input_tokens: u64,
    /// Output token count from the most recent step
    #[serde(default)]
    pub last_known_output_tokens: u64,

    // -- Relay state: the checkpoint for a paused run ------------------------
    /// Frontend tool calls the agent is waiting on
    #[serde(default)]
    pub pending_frontend_tools: Vec<PendingFrontendTool>,
    /// Backend tool results already produced in the paused step
    #[serde(default)]
    pub pending_backend_results: Vec<ToolResultBlock>,
    /// The paused step's assistant message, not yet appended to history
    #[serde(default)]
    pub pending_assistant_message: Option<Message>,
    /// Whether the agent is paused awaiting frontend tool results
    #[serde(default)]
    pub awaiting_frontend_tools: bool,
    /// Step counter at the pause point
    #[serde(default)]
    pub current_step: u32,

    /// Durable conversation history snapshot
    #[serde(default)]
    pub conversation_history: Vec<Message>,

    /// Forward-compatible extension point for adapter-specific fields
    #[serde(default)]
    pub extras: serde_json::Map<String, Value>,
}

impl AgentConfig {
    /// Creates a new builder for constructing [`AgentConfig`].
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Whether the agent has relay state to resume.
    pub fn is_awaiting_frontend_tools(&self) -> bool {
        self.awaiting_frontend_tools
    }

    /// Clear all relay state after a successful resume or a reset.
    pub fn clear_relay_state(&mut self) {
        self.pending_frontend_tools.clear();
        self.pending_backend_results.clear();
        self.pending_assistant_message = None;
        self.awaiting_frontend_tools = false;
        self.current_step = 0;
    }
}

/// Builder for [`AgentConfig`] with validation.
///
/// `model` is required; everything else has a documented default. `build()`
/// stamps `agent_uuid` (v4) and `created_at` unless explicitly provided,
/// which is how a caller rehydrates an existing agent: pass the stored UUID
/// and let `Agent::initialize` load the rest.
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    agent_uuid: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    server_tools: Vec<Value>,
    beta_headers: Vec<String>,
    max_steps: Option<u32>,
    max_tokens: Option<u32>,
    thinking_tokens: Option<u32>,
    max_retries: Option<u32>,
    base_delay: Option<f64>,
    token_budget: Option<u64>,
    formatter: Option<FormatterKind>,
    compactor: Option<CompactorKind>,
    memory_store: Option<MemoryStoreKind>,
    title: Option<String>,
}

impl AgentConfigBuilder {
    /// Reuse an existing agent identity instead of minting a new one.
    pub fn agent_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.agent_uuid = Some(uuid.into());
        self
    }

    /// Sets the model identifier (required).
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Adds a server-side tool definition, passed through to the provider.
    pub fn server_tool(mut self, tool: Value) -> Self {
        self.server_tools.push(tool);
        self
    }

    /// Adds a beta feature tag, passed through to the provider.
    pub fn beta_header(mut self, header: impl Into<String>) -> Self {
        self.beta_headers.push(header.into());
        self
    }

    /// Sets the step budget per run (must be ≥ 1).
    pub fn max_steps(mut self, steps: u32) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Sets the per-response output token cap.
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the thinking token budget; 0 disables thinking.
    pub fn thinking_tokens(mut self, tokens: u32) -> Self {
        self.thinking_tokens = Some(tokens);
        self
    }

    /// Sets the retry attempt budget (must be ≥ 1).
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the base backoff delay in seconds.
    pub fn base_delay(mut self, seconds: f64) -> Self {
        self.base_delay = Some(seconds);
        self
    }

    /// Overrides the context token budget used to trigger compaction.
    pub fn token_budget(mut self, tokens: u64) -> Self {
        self.token_budget = Some(tokens);
        self
    }

    /// Selects the output formatter.
    pub fn formatter(mut self, kind: FormatterKind) -> Self {
        self.formatter = Some(kind);
        self
    }

    /// Selects the compaction strategy.
    pub fn compactor(mut self, kind: CompactorKind) -> Self {
        self.compactor = Some(kind);
        self
    }

    /// Selects the memory store.
    pub fn memory_store(mut self, kind: MemoryStoreKind) -> Self {
        self.memory_store = Some(kind);
        self
    }

    /// Sets the session title.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Validate and build the config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `model` is missing or empty, or when
    /// `max_steps` / `max_retries` are zero, or `base_delay` is negative.
    pub fn build(self) -> Result<AgentConfig> {
        let model = self
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::config("model is required"))?;

        let max_steps = self.max_steps.unwrap_or(DEFAULT_MAX_STEPS);
        if max_steps == 0 {
            return Err(Error::config("max_steps must be at least 1"));
        }

        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries == 0 {
            return Err(Error::config("max_retries must be at least 1"));
        }

        let base_delay = self.base_delay.unwrap_or(DEFAULT_BASE_DELAY);
        if base_delay < 0.0 {
            return Err(Error::config("base_delay must not be negative"));
        }

        let now = Utc::now();
        Ok(AgentConfig {
            agent_uuid: self
                .agent_uuid
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            model,
            system_prompt: self.system_prompt.unwrap_or_default(),
            tool_schemas: Vec::new(),
            frontend_tool_schemas: Vec::new(),
            server_tools: self.server_tools,
            beta_headers: self.beta_headers,
            max_steps,
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            thinking_tokens: self.thinking_tokens.unwrap_or(0),
            max_retries,
            base_delay,
            token_budget: self.token_budget,
            formatter: self.formatter.unwrap_or_default(),
            compactor: self.compactor.unwrap_or_default(),
            memory_store: self.memory_store.unwrap_or_default(),
            title: self.title,
            created_at: Some(now),
            updated_at: Some(now),
            last_run_at: None,
            total_runs: 0,
            last_known_input_tokens: 0,
            last_known_output_tokens: 0,
            pending_frontend_tools: Vec::new(),
            pending_backend_results: Vec::new(),
            pending_assistant_message: None,
            awaiting_frontend_tools: false,
            current_step: 0,
            conversation_history: Vec::new(),
            extras: serde_json::Map::new(),
        })
    }
}
