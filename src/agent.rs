//! The agent core: a bounded, checkpointable tool-use loop.
//!
//! An [`Agent`] owns the state machine that coordinates everything else:
//! it prepares requests from durable history, drives the retrying stream
//! through the formatter onto the caller's output channel, dispatches the
//! model's tool calls, compacts history when the next request would blow
//! the token budget, and checkpoints after every step.
//!
//! # States
//!
//! `Idle → Preparing → Streaming → ToolDispatching → Compacting →
//! Persisting → …`, terminating in `Done`, `Failed`, or
//! `AwaitingFrontend`. One agent instance processes one step at a time;
//! tool execution within a step is sequential in the order of the
//! assistant's tool_use blocks.
//!
//! # Frontend tools and the relay
//!
//! When the model calls a tool whose executor is frontend, the agent does
//! not execute it. It stashes the step's assistant message, the backend
//! results it already produced, and the pending frontend descriptors in
//! the config's relay state, persists the checkpoint, emits a terminal
//! `awaiting_frontend_tools` chunk, and returns. A fresh process can load
//! the same `agent_uuid`, observe the pending state, and resume with
//! [`Agent::continue_with_tool_results`]. Durable history never contains
//! an assistant message without its full tool-result complement: the
//! stashed message is only appended once every result is in.
//!
//! # Failure policy
//!
//! Tool failures and unknown tool names become `tool_result` blocks with
//! `is_error` set — the model gets a chance to recover. Only exhausted
//! retries, non-retryable provider errors, storage write failures, and
//! caller cancellation abort a run; after any fatal termination the run
//! log carries a terminal `error` event and the agent returns to `Idle`.

use crate::compact::{
    CompactionContext, Compactor, compactor_for, estimate_request_tokens, model_token_limit,
};
use crate::config::{AgentConfig, PendingFrontendTool};
use crate::error::{Error, Result};
use crate::files::FileBackend;
use crate::logging::RunScope;
use crate::memory::{MemoryStore, memory_store_for};
use crate::pricing::{CostBreakdown, calculate_run_cost};
use crate::provider::{ProviderClient, ProviderRequest};
use crate::retry::{RetryPolicy, stream_with_backoff};
use crate::storage::memory::{MemoryConfigStore, MemoryConversationStore, MemoryRunLogStore};
use crate::storage::{
    ConfigStore, ConversationRecord, ConversationStore, RunLogEvent, RunLogStore,
};
use crate::streaming::{
    OutputSender, awaiting_frontend_tools_chunk, meta_init_chunk, tool_result_chunk,
};
use crate::tools::{ToolDescriptor, ToolExecutor, ToolRegistry};
use crate::types::{
    ContentBlock, Message, ProviderMessage, StepUsage, StopReason, ToolResultBlock,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where the agent's state machine currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Preparing,
    Streaming,
    ToolDispatching,
    Compacting,
    Persisting,
    AwaitingFrontend,
    Done,
    Failed,
}

/// A frontend tool result handed back through the resume API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendToolResult {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    /// end_turn, stop_sequence, max_tokens, max_steps, or
    /// awaiting_frontend_tools
    pub stop_reason: String,
    /// Final assistant text, when the run produced one
    pub final_text: Option<String>,
    pub total_steps: u32,
    pub usage: Vec<StepUsage>,
    pub cost: Option<CostBreakdown>,
    /// Pending descriptors when paused for frontend tools
    #[serde(default)]
    pub pending_frontend_tools: Vec<PendingFrontendTool>,
}

/// Builder for [`Agent`]. Config and provider client are required; stores
/// default to the in-memory adapters.
pub struct AgentBuilder {
    config: Option<AgentConfig>,
    client: Option<Arc<dyn ProviderClient>>,
    tools: Vec<ToolDescriptor>,
    config_store: Option<Arc<dyn ConfigStore>>,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    run_log_store: Option<Arc<dyn RunLogStore>>,
    file_backend: Option<Arc<dyn FileBackend>>,
}

impl AgentBuilder {
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Register a tool (backend or frontend).
    pub fn tool(mut self, descriptor: ToolDescriptor) -> Self {
        self.tools.push(descriptor);
        self
    }

    /// Register several tools at once.
    pub fn tools(mut self, descriptors: Vec<ToolDescriptor>) -> Self {
        self.tools.extend(descriptors);
        self
    }

    pub fn config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversation_store = Some(store);
        self
    }

    pub fn run_log_store(mut self, store: Arc<dyn RunLogStore>) -> Self {
        self.run_log_store = Some(store);
        self
    }

    pub fn file_backend(mut self, backend: Arc<dyn FileBackend>) -> Self {
        self.file_backend = Some(backend);
        self
    }

    /// Validate and assemble the agent.
    pub fn build(self) -> Result<Agent> {
        let mut config = self
            .config
            .ok_or_else(|| Error::config("agent config is required"))?;
        let client = self
            .client
            .ok_or_else(|| Error::config("provider client is required"))?;

        let mut registry = ToolRegistry::new();
        registry.register_all(self.tools)?;
        registry.bind_agent(&config.agent_uuid);

        config.tool_schemas = registry.schemas_for(ToolExecutor::Backend);
        config.frontend_tool_schemas = registry.schemas_for(ToolExecutor::Frontend);

        let memory = memory_store_for(config.memory_store);
        let compactor = compactor_for(config.compactor, Some(client.clone()));

        Ok(Agent {
            registry,
            client,
            config_store: self
                .config_store
                .unwrap_or_else(|| Arc::new(MemoryConfigStore::new())),
            conversation_store: self
                .conversation_store
                .unwrap_or_else(|| Arc::new(MemoryConversationStore::new())),
            run_log_store: self
                .run_log_store
                .unwrap_or_else(|| Arc::new(MemoryRunLogStore::new())),
            file_backend: self.file_backend,
            memory,
            compactor,
            state: AgentState::Idle,
            interrupted: Arc::new(AtomicBool::new(false)),
            config,
        })
    }
}

/// The agent: owns durable config (including history and relay state) and
/// orchestrates provider, tools, compactor, and stores.
pub struct Agent {
    config: AgentConfig,
    registry: ToolRegistry,
    client: Arc<dyn ProviderClient>,
    config_store: Arc<dyn ConfigStore>,
    conversation_store: Arc<dyn ConversationStore>,
    run_log_store: Arc<dyn RunLogStore>,
    file_backend: Option<Arc<dyn FileBackend>>,
    memory: Box<dyn MemoryStore>,
    compactor: Box<dyn Compactor>,
    state: AgentState,
    interrupted: Arc<AtomicBool>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder {
            config: None,
            client: None,
            tools: Vec::new(),
            config_store: None,
            conversation_store: None,
            run_log_store: None,
            file_backend: None,
        }
    }

    /// Open the stores and rehydrate persisted state for this
    /// `agent_uuid`, if any exists. Call once before the first run.
    ///
    /// A stored checkpoint wins over builder-supplied settings; tool
    /// schemas always come from the live registry.
    pub async fn initialize(&mut self) -> Result<()> {
        self.config_store.open().await?;
        self.conversation_store.open().await?;
        self.run_log_store.open().await?;
        if let Some(backend) = &self.file_backend {
            backend.open().await?;
        }

        if let Some(mut stored) = self.config_store.load(&self.config.agent_uuid).await? {
            stored.tool_schemas = self.registry.schemas_for(ToolExecutor::Backend);
            stored.frontend_tool_schemas = self.registry.schemas_for(ToolExecutor::Frontend);
            self.memory = memory_store_for(stored.memory_store);
            self.compactor = compactor_for(stored.compactor, Some(self.client.clone()));
            log::info!(
                "agent={} rehydrated from storage (awaiting_frontend_tools={})",
                stored.agent_uuid,
                stored.awaiting_frontend_tools
            );
            self.config = stored;
        } else {
            self.config_store.save(&self.config).await?;
        }

        if self.config.awaiting_frontend_tools {
            self.state = AgentState::AwaitingFrontend;
        }
        Ok(())
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn agent_uuid(&self) -> &str {
        &self.config.agent_uuid
    }

    /// Durable conversation history.
    pub fn history(&self) -> &[Message] {
        &self.config.conversation_history
    }

    /// Pending frontend tool calls, when paused.
    pub fn pending_frontend_tools(&self) -> &[PendingFrontendTool] {
        &self.config.pending_frontend_tools
    }

    /// Signal cancellation. The run stops at the next suspension point;
    /// partial state is persisted best-effort. Safe to call repeatedly and
    /// from other tasks.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Handle for signalling cancellation from another task.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    // ------------------------------------------------------------------
    // Run entry points
    // ------------------------------------------------------------------

    /// Execute a run for one user prompt, streaming chunks to `tx`.
    pub async fn run(&mut self, prompt: &str, tx: OutputSender) -> Result<RunOutcome> {
        if self.config.awaiting_frontend_tools {
            return Err(Error::relay(
                "agent is awaiting frontend tool results; call continue_with_tool_results",
            ));
        }

        self.interrupted.store(false, Ordering::SeqCst);
        let run_id = uuid::Uuid::new_v4().to_string();
        let scope = RunScope::new(self.config.agent_uuid.clone(), run_id.clone());
        log::info!("{scope} run started");

        let mut record =
            ConversationRecord::start(self.config.agent_uuid.clone(), run_id.clone(), prompt);
        let mut run_log: Vec<RunLogEvent> = Vec::new();
        let history_start = self.config.conversation_history.len();

        self.config
            .conversation_history
            .push(Message::user(prompt));

        // Memory retrieval may inject transient context; it is request-only
        // and never enters durable history.
        let user_message = Message::user(prompt);
        let tools = self.request_tools();
        let transient = match self
            .memory
            .retrieve(
                &tools,
                &user_message,
                &self.config.conversation_history,
                &self.config.model,
            )
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("{scope} memory retrieve failed: {e}");
                Vec::new()
            }
        };

        self.step_loop(
            &tx,
            scope,
            &mut record,
            &mut run_log,
            transient,
            1,
            history_start,
        )
        .await
    }

    /// Resume a paused run with the frontend tool results.
    ///
    /// Validation is all-or-nothing: the agent must be awaiting, the
    /// result count must match the pending count, and every `tool_use_id`
    /// must match exactly one pending descriptor. Nothing is mutated until
    /// validation passes.
    pub async fn continue_with_tool_results(
        &mut self,
        results: Vec<FrontendToolResult>,
        tx: OutputSender,
    ) -> Result<RunOutcome> {
        if !self.config.awaiting_frontend_tools {
            return Err(Error::relay("agent is not awaiting frontend tools"));
        }
        if self.config.pending_frontend_tools.is_empty() {
            return Err(Error::relay("no pending frontend tools to resume"));
        }
        if results.len() != self.config.pending_frontend_tools.len() {
            return Err(Error::relay(format!(
                "tool result mismatch: expected {} results, got {}",
                self.config.pending_frontend_tools.len(),
                results.len()
            )));
        }

        let mut by_id: std::collections::HashMap<String, FrontendToolResult> =
            std::collections::HashMap::new();
        for result in results {
            if by_id.insert(result.tool_use_id.clone(), result).is_some() {
                return Err(Error::relay("tool result mismatch: duplicate tool_use_id"));
            }
        }
        for pending in &self.config.pending_frontend_tools {
            if !by_id.contains_key(&pending.tool_use_id) {
                return Err(Error::relay(format!(
                    "tool result mismatch: missing result for tool_use_id '{}'",
                    pending.tool_use_id
                )));
            }
        }

        let assistant = self
            .config
            .pending_assistant_message
            .clone()
            .ok_or_else(|| Error::relay("relay state is missing the paused assistant message"))?;

        // Merge: frontend results interleave with the stashed backend
        // results, preserving the tool_use order of the assistant message.
        let mut result_blocks = Vec::new();
        for block in &assistant.content {
            if let ContentBlock::ToolUse(tool_use) = block {
                if let Some(frontend) = by_id.get(&tool_use.id) {
                    let mut block = ToolResultBlock::text(&frontend.tool_use_id, &frontend.content);
                    if frontend.is_error {
                        block.is_error = Some(true);
                    }
                    result_blocks.push(ContentBlock::ToolResult(block));
                } else if let Some(backend) = self
                    .config
                    .pending_backend_results
                    .iter()
                    .find(|r| r.tool_use_id == tool_use.id)
                {
                    result_blocks.push(ContentBlock::ToolResult(backend.clone()));
                }
            }
        }

        self.interrupted.store(false, Ordering::SeqCst);
        let resume_step = self.config.current_step + 1;
        let history_start = self.config.conversation_history.len();

        self.config.conversation_history.push(assistant);
        self.config
            .conversation_history
            .push(Message::user_blocks(result_blocks));
        self.config.clear_relay_state();

        let run_id = uuid::Uuid::new_v4().to_string();
        let scope = RunScope::new(self.config.agent_uuid.clone(), run_id.clone());
        log::info!("{scope} resuming from frontend tools at step {resume_step}");

        let mut record = ConversationRecord::start(
            self.config.agent_uuid.clone(),
            run_id.clone(),
            "[frontend tool results]",
        );
        let mut run_log: Vec<RunLogEvent> = Vec::new();

        self.step_loop(
            &tx,
            scope,
            &mut record,
            &mut run_log,
            Vec::new(),
            resume_step,
            history_start,
        )
        .await
    }

    // ------------------------------------------------------------------
    // The step loop
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn step_loop(
        &mut self,
        tx: &OutputSender,
        scope: RunScope,
        record: &mut ConversationRecord,
        run_log: &mut Vec<RunLogEvent>,
        transient: Vec<Message>,
        start_step: u32,
        history_start: usize,
    ) -> Result<RunOutcome> {
        let mut usage_history: Vec<StepUsage> = Vec::new();
        let mut step = start_step;

        loop {
            if step > self.config.max_steps {
                log::warn!("{scope} max_steps ({}) exceeded", self.config.max_steps);
                run_log.push(RunLogEvent::error(
                    "max_steps",
                    json!({"max_steps": self.config.max_steps}),
                ));
                return self
                    .finish_run(
                        scope.clone(),
                        record,
                        run_log,
                        usage_history,
                        "max_steps",
                        step - 1,
                        history_start,
                    )
                    .await;
            }

            let step_scope = scope.at_step(step);

            if self.interrupted.load(Ordering::SeqCst) {
                return self
                    .cancel_run(step_scope, record, run_log, usage_history, history_start)
                    .await;
            }

            // --- Preparing -------------------------------------------------
            self.state = AgentState::Preparing;
            run_log.push(RunLogEvent::step_start(step));
            let tools = self.request_tools();

            // Compaction is a function of durable history only, checked
            // against the model budget before every request.
            let budget = self
                .config
                .token_budget
                .unwrap_or_else(|| model_token_limit(&self.config.model));
            let estimate = estimate_request_tokens(
                &self.config.conversation_history,
                Some(&self.config.system_prompt),
                &tools,
            );
            if estimate > budget {
                self.state = AgentState::Compacting;
                let ctx = CompactionContext {
                    system: Some(&self.config.system_prompt),
                    tools: &tools,
                    model: &self.config.model,
                    budget,
                };
                match self
                    .compactor
                    .compact(std::mem::take(&mut self.config.conversation_history), &ctx)
                    .await
                {
                    Ok((compacted, info)) => {
                        log::info!(
                            "{step_scope} compacted history: {} -> {} tokens ({})",
                            info.tokens_before,
                            info.tokens_after,
                            info.strategy
                        );
                        self.config.conversation_history = compacted;
                        run_log.push(RunLogEvent::compaction(
                            step,
                            serde_json::to_value(&info).unwrap_or_default(),
                        ));
                    }
                    Err(e) => {
                        // Identity fallback: the run continues uncompacted.
                        log::warn!("{step_scope} compactor failed, continuing uncompacted: {e}");
                        run_log.push(RunLogEvent::error(
                            "compactor",
                            json!({"error": e.to_string(), "fallback": "identity"}),
                        ));
                    }
                }
            }

            let mut request_messages = self.config.conversation_history.clone();
            request_messages.extend(transient.iter().cloned());

            let request = ProviderRequest {
                model: self.config.model.clone(),
                messages: request_messages,
                system: (!self.config.system_prompt.is_empty())
                    .then(|| self.config.system_prompt.clone()),
                tools,
                max_tokens: self.config.max_tokens,
                beta_headers: self.config.beta_headers.clone(),
                extra_options: self.request_extra_options(),
            };

            let _ = tx
                .send(meta_init_chunk(
                    self.config.formatter,
                    &json!({
                        "agent_uuid": self.config.agent_uuid,
                        "model": self.config.model,
                        "run_id": scope.run_id,
                        "step_number": step,
                    }),
                ))
                .await;

            // --- Streaming -------------------------------------------------
            self.state = AgentState::Streaming;
            let policy = RetryPolicy::new(self.config.max_retries, self.config.base_delay);
            let message = match stream_with_backoff(
                self.client.as_ref(),
                &request,
                self.config.formatter,
                tx,
                &policy,
                &step_scope,
                run_log,
            )
            .await
            {
                Ok(message) => message,
                Err(e) => {
                    return self
                        .fail_run(step_scope, record, run_log, usage_history, history_start, e)
                        .await;
                }
            };

            let step_usage = StepUsage::from_usage(step, &message.usage);
            usage_history.push(step_usage);
            self.config.last_known_input_tokens = message.usage.input_tokens;
            self.config.last_known_output_tokens = message.usage.output_tokens;

            if self.interrupted.load(Ordering::SeqCst) {
                // The assistant message arrived whole; keep it.
                self.config
                    .conversation_history
                    .push(message.into_message());
                return self
                    .cancel_run(step_scope, record, run_log, usage_history, history_start)
                    .await;
            }

            // --- Classify stop ---------------------------------------------
            match message.stop_reason {
                Some(StopReason::ToolUse) => {
                    let outcome = self
                        .dispatch_tools(tx, &step_scope, run_log, message, step)
                        .await;
                    match outcome {
                        ToolDispatchOutcome::Continue => {
                            run_log.push(RunLogEvent::step_end(
                                step,
                                json!({"stop_reason": "tool_use"}),
                            ));
                            self.persist_checkpoint(&step_scope, &scope.run_id, run_log)
                                .await?;
                            step += 1;
                        }
                        ToolDispatchOutcome::AwaitFrontend => {
                            return self
                                .pause_for_frontend(
                                    tx,
                                    step_scope,
                                    record,
                                    run_log,
                                    usage_history,
                                    step,
                                    history_start,
                                )
                                .await;
                        }
                    }
                }
                Some(reason @ (StopReason::EndTurn | StopReason::StopSequence)) => {
                    let reason = reason.as_str();
                    self.config
                        .conversation_history
                        .push(message.into_message());
                    run_log.push(RunLogEvent::step_end(step, json!({"stop_reason": reason})));
                    return self
                        .finish_run(
                            scope.clone(),
                            record,
                            run_log,
                            usage_history,
                            reason,
                            step,
                            history_start,
                        )
                        .await;
                }
                Some(StopReason::MaxTokens) => {
                    // Like end_turn, but the truncation is recorded.
                    self.config
                        .conversation_history
                        .push(message.into_message());
                    run_log.push(RunLogEvent::step_end(
                        step,
                        json!({"stop_reason": "max_tokens", "truncated": true}),
                    ));
                    return self
                        .finish_run(
                            scope.clone(),
                            record,
                            run_log,
                            usage_history,
                            "max_tokens",
                            step,
                            history_start,
                        )
                        .await;
                }
                other => {
                    let reason = other.map_or("missing", |r| r.as_str());
                    let err = Error::unknown(format!("unexpected stop reason: {reason}"));
                    return self
                        .fail_run(step_scope, record, run_log, usage_history, history_start, err)
                        .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tool dispatch
    // ------------------------------------------------------------------

    async fn dispatch_tools(
        &mut self,
        tx: &OutputSender,
        scope: &RunScope,
        run_log: &mut Vec<RunLogEvent>,
        message: ProviderMessage,
        step: u32,
    ) -> ToolDispatchOutcome {
        self.state = AgentState::ToolDispatching;

        let assistant = message.into_message();
        let mut backend_results: Vec<ToolResultBlock> = Vec::new();
        let mut pending_frontend: Vec<PendingFrontendTool> = Vec::new();

        for block in &assistant.content {
            // Server tool blocks are already fulfilled by the provider; they
            // stay in history as-is and are never dispatched.
            let ContentBlock::ToolUse(tool_use) = block else {
                continue;
            };

            run_log.push(RunLogEvent::tool_call(step, &tool_use.name, &tool_use.id));

            match self.registry.get(&tool_use.name).map(|t| t.executor()) {
                Some(ToolExecutor::Frontend) => {
                    log::info!(
                        "{scope} frontend tool '{}' requested (id={})",
                        tool_use.name,
                        tool_use.id
                    );
                    pending_frontend.push(PendingFrontendTool {
                        tool_use_id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        input: tool_use.input.clone(),
                    });
                }
                Some(ToolExecutor::Backend) | None => {
                    // Unknown names fall through to the registry, which
                    // folds them into an error-string result.
                    let execution = self
                        .registry
                        .execute(
                            &tool_use.name,
                            tool_use.input.clone(),
                            self.file_backend.as_deref(),
                            Some(&self.config.agent_uuid),
                        )
                        .await;

                    run_log.push(RunLogEvent::tool_result(
                        step,
                        &tool_use.name,
                        &tool_use.id,
                        execution.is_error,
                    ));

                    // Consumers get text plus references; the API payload
                    // keeps the base64 content.
                    let body = if execution.image_refs.is_empty() {
                        execution.content.to_text()
                    } else {
                        json!({
                            "content": execution.content.to_text(),
                            "images": execution.image_refs,
                        })
                        .to_string()
                    };
                    let _ = tx
                        .send(tool_result_chunk(
                            self.config.formatter,
                            &tool_use.id,
                            &tool_use.name,
                            &body,
                        ))
                        .await;

                    let mut result = ToolResultBlock {
                        tool_use_id: tool_use.id.clone(),
                        content: execution.content,
                        is_error: None,
                    };
                    if execution.is_error {
                        result.is_error = Some(true);
                    }
                    backend_results.push(result);
                }
            }
        }

        if !pending_frontend.is_empty() {
            self.config.pending_assistant_message = Some(assistant);
            self.config.pending_backend_results = backend_results;
            self.config.pending_frontend_tools = pending_frontend;
            return ToolDispatchOutcome::AwaitFrontend;
        }

        // Assistant message and its results land atomically, results in
        // tool_use order within a single user message.
        self.config.conversation_history.push(assistant);
        if !backend_results.is_empty() {
            self.config.conversation_history.push(Message::user_blocks(
                backend_results
                    .into_iter()
                    .map(ContentBlock::ToolResult)
                    .collect(),
            ));
        }
        ToolDispatchOutcome::Continue
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn pause_for_frontend(
        &mut self,
        tx: &OutputSender,
        scope: RunScope,
        record: &mut ConversationRecord,
        run_log: &mut Vec<RunLogEvent>,
        usage_history: Vec<StepUsage>,
        step: u32,
        history_start: usize,
    ) -> Result<RunOutcome> {
        self.state = AgentState::Persisting;
        self.config.awaiting_frontend_tools = true;
        self.config.current_step = step;
        self.config.updated_at = Some(chrono::Utc::now());

        run_log.push(RunLogEvent::finish(json!({
            "stop_reason": "awaiting_frontend_tools",
            "pending": self.config.pending_frontend_tools.len(),
        })));

        record.completed_at = Some(chrono::Utc::now());
        record.stop_reason = Some("awaiting_frontend_tools".to_string());
        record.total_steps = step;
        record.usage = usage_history.clone();
        record.cost = calculate_run_cost(&usage_history, &self.config.model);
        record.messages = self.config.conversation_history[history_start..].to_vec();

        self.persist_all(&scope, record, run_log).await?;

        let _ = tx
            .send(awaiting_frontend_tools_chunk(
                self.config.formatter,
                &self.config.pending_frontend_tools,
            ))
            .await;

        log::info!(
            "{scope} paused awaiting {} frontend tool(s)",
            self.config.pending_frontend_tools.len()
        );
        self.state = AgentState::AwaitingFrontend;

        Ok(RunOutcome {
            run_id: scope.run_id,
            stop_reason: "awaiting_frontend_tools".to_string(),
            final_text: None,
            total_steps: step,
            usage: usage_history,
            cost: record.cost.clone(),
            pending_frontend_tools: self.config.pending_frontend_tools.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_run(
        &mut self,
        scope: RunScope,
        record: &mut ConversationRecord,
        run_log: &mut Vec<RunLogEvent>,
        usage_history: Vec<StepUsage>,
        stop_reason: &str,
        total_steps: u32,
        history_start: usize,
    ) -> Result<RunOutcome> {
        self.state = AgentState::Persisting;

        let final_text = self
            .config
            .conversation_history
            .last()
            .filter(|m| m.role == crate::types::Role::Assistant)
            .map(Message::text)
            .filter(|t| !t.is_empty());

        let tools = self.request_tools();
        match self
            .memory
            .update(
                &self.config.conversation_history,
                &self.config.conversation_history,
                &tools,
                &self.config.model,
            )
            .await
        {
            Ok(metadata) => run_log.push(RunLogEvent::finish(json!({
                "stop_reason": stop_reason,
                "memory": metadata,
            }))),
            Err(e) => {
                log::warn!("{scope} memory update failed: {e}");
                run_log.push(RunLogEvent::finish(json!({"stop_reason": stop_reason})));
            }
        }

        let now = chrono::Utc::now();
        self.config.total_runs += 1;
        self.config.last_run_at = Some(now);
        self.config.updated_at = Some(now);

        record.completed_at = Some(now);
        record.stop_reason = Some(stop_reason.to_string());
        record.final_response = final_text.clone();
        record.total_steps = total_steps;
        record.usage = usage_history.clone();
        record.cost = calculate_run_cost(&usage_history, &self.config.model);
        record.messages = self.config.conversation_history[history_start..].to_vec();

        self.persist_all(&scope, record, run_log).await?;

        log::info!("{scope} run finished: {stop_reason} after {total_steps} step(s)");
        let outcome = RunOutcome {
            run_id: scope.run_id,
            stop_reason: stop_reason.to_string(),
            final_text,
            total_steps,
            usage: usage_history,
            cost: record.cost.clone(),
            pending_frontend_tools: Vec::new(),
        };
        // Done, and immediately ready for another run on this agent_uuid.
        self.state = AgentState::Idle;
        Ok(outcome)
    }

    async fn cancel_run(
        &mut self,
        scope: RunScope,
        record: &mut ConversationRecord,
        run_log: &mut Vec<RunLogEvent>,
        usage_history: Vec<StepUsage>,
        history_start: usize,
    ) -> Result<RunOutcome> {
        log::warn!("{scope} run interrupted by caller");
        run_log.push(RunLogEvent::error("interrupted", json!({})));

        record.completed_at = Some(chrono::Utc::now());
        record.stop_reason = Some("interrupted".to_string());
        record.usage = usage_history;
        record.messages = self.config.conversation_history[history_start..].to_vec();
        self.config.updated_at = Some(chrono::Utc::now());

        // Best effort: a failing store must not mask the cancellation.
        if let Err(e) = self.persist_all(&scope, record, run_log).await {
            log::warn!("{scope} checkpoint during cancellation failed: {e}");
        }

        self.state = AgentState::Idle;
        Err(Error::Interrupted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_run(
        &mut self,
        scope: RunScope,
        record: &mut ConversationRecord,
        run_log: &mut Vec<RunLogEvent>,
        usage_history: Vec<StepUsage>,
        history_start: usize,
        error: Error,
    ) -> Result<RunOutcome> {
        self.state = AgentState::Failed;
        log::error!("{scope} run failed: {error}");
        run_log.push(RunLogEvent::error(
            error.kind().as_str(),
            json!({"error": error.to_string()}),
        ));

        record.completed_at = Some(chrono::Utc::now());
        record.stop_reason = Some("error".to_string());
        record.usage = usage_history;
        record.messages = self.config.conversation_history[history_start..].to_vec();
        self.config.updated_at = Some(chrono::Utc::now());

        if let Err(e) = self.persist_all(&scope, record, run_log).await {
            log::warn!("{scope} checkpoint during failure handling failed: {e}");
        }

        // Ready for another run on the same agent_uuid.
        self.state = AgentState::Idle;
        Err(error)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Per-step checkpoint: config and run log. Storage failures are
    /// retried a few times, then fail the run.
    async fn persist_checkpoint(
        &mut self,
        scope: &RunScope,
        run_id: &str,
        run_log: &[RunLogEvent],
    ) -> Result<()> {
        self.state = AgentState::Persisting;
        self.config.updated_at = Some(chrono::Utc::now());

        save_with_retry(scope, "config", || {
            self.config_store.save(&self.config)
        })
        .await?;
        save_with_retry(scope, "run log", || {
            self.run_log_store
                .save(&self.config.agent_uuid, run_id, run_log)
        })
        .await
    }

    /// Full persistence at a terminal transition: config, conversation
    /// record, run log.
    async fn persist_all(
        &mut self,
        scope: &RunScope,
        record: &mut ConversationRecord,
        run_log: &[RunLogEvent],
    ) -> Result<()> {
        save_with_retry(scope, "config", || {
            self.config_store.save(&self.config)
        })
        .await?;

        // The store assigns the sequence number into a scratch copy so a
        // failed attempt never leaves a half-written number on the record.
        let mut last = None;
        let mut saved = false;
        for attempt in 1..=3u32 {
            let mut scratch = record.clone();
            match self.conversation_store.save(&mut scratch).await {
                Ok(()) => {
                    record.sequence_number = scratch.sequence_number;
                    saved = true;
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "{scope} saving conversation record failed (attempt {attempt}/3): {e}"
                    );
                    last = Some(e);
                }
            }
        }
        if !saved {
            return Err(last.unwrap_or_else(|| Error::storage("conversation record save failed")));
        }

        save_with_retry(scope, "run log", || {
            self.run_log_store
                .save(&self.config.agent_uuid, &scope.run_id, run_log)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Request assembly
    // ------------------------------------------------------------------

    /// Tool schemas for the request: backend + frontend + server-provider
    /// tools, in that order.
    fn request_tools(&self) -> Vec<Value> {
        let mut tools = self.registry.schemas_for(ToolExecutor::Backend);
        tools.extend(self.registry.schemas_for(ToolExecutor::Frontend));
        tools.extend(self.config.server_tools.iter().cloned());
        tools
    }

    fn request_extra_options(&self) -> serde_json::Map<String, Value> {
        let mut extra = serde_json::Map::new();
        if self.config.thinking_tokens > 0 {
            extra.insert(
                "thinking".into(),
                json!({"type": "enabled", "budget_tokens": self.config.thinking_tokens}),
            );
        }
        extra
    }
}

enum ToolDispatchOutcome {
    Continue,
    AwaitFrontend,
}

/// Retry a storage write a few times before giving up; storage failures
/// past the bound fail the run.
async fn save_with_retry<F, Fut>(scope: &RunScope, what: &str, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    const ATTEMPTS: u32 = 3;
    let mut last = None;
    for attempt in 1..=ATTEMPTS {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("{scope} saving {what} failed (attempt {attempt}/{ATTEMPTS}): {e}");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::storage(format!("saving {what} failed"))))
}
