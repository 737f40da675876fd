//! # Relay Agent SDK
//!
//! A streaming-first Rust SDK for building provider-abstracted LLM agents
//! with a bounded tool-use loop, durable checkpoints, and a cooperative
//! pause/resume protocol for tools that execute off-process.
//!
//! ## Key Features
//!
//! - **Streaming Output**: provider events are normalized into delimited
//!   chunks (or raw JSON frames) on a bounded, back-pressured channel
//! - **Tool Calling**: backend tools run in-process; frontend tools pause
//!   the run, checkpoint it, and resume with results from anywhere
//! - **Retry Logic**: whole-stream retry with exponential backoff and
//!   jitter for transient provider failures
//! - **Context Compaction**: token-budgeted history shrinking with
//!   pluggable strategies
//! - **Durable State**: config, conversation records, and run logs persist
//!   through pluggable storage adapters (memory and flat-file included)
//! - **Cost Tracking**: per-run cost breakdowns from per-step token usage
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_agent::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::builder()
//!         .model("claude-sonnet-4-5")
//!         .system_prompt("You are a helpful assistant")
//!         .max_steps(10)
//!         .build()?;
//!
//!     let client = Arc::new(HttpProviderClient::new(
//!         "https://api.anthropic.com",
//!         std::env::var("API_KEY")?,
//!         120,
//!     )?);
//!
//!     let add = ToolDescriptor::backend(
//!         "add",
//!         "Add two numbers together",
//!         json!({
//!             "type": "object",
//!             "properties": {
//!                 "a": {"type": "number"},
//!                 "b": {"type": "number"}
//!             },
//!             "required": ["a", "b"]
//!         }),
//!         |input| async move {
//!             let a = input["a"].as_f64().unwrap_or(0.0);
//!             let b = input["b"].as_f64().unwrap_or(0.0);
//!             Ok(ToolOutput::text(format!("{}", a + b)))
//!         },
//!     );
//!
//!     let mut agent = Agent::builder()
//!         .config(config)
//!         .client(client)
//!         .tool(add)
//!         .build()?;
//!     agent.initialize().await?;
//!
//!     let (tx, mut rx) = output_channel();
//!     let consumer = tokio::spawn(async move {
//!         while let Some(chunk) = rx.recv().await {
//!             print!("{chunk}");
//!         }
//!     });
//!
//!     let outcome = agent.run("What is 2 + 3?", tx).await?;
//!     consumer.await?;
//!     println!("\nstop: {} steps: {}", outcome.stop_reason, outcome.total_steps);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **agent**: the state machine and step loop that orchestrates the rest
//! - **provider**: wire-level streaming contract and the HTTP client
//! - **streaming**: formatters from provider events to output chunks
//! - **retry**: exponential-backoff retry around whole streams
//! - **tools**: tool descriptors, handlers, and the dispatch registry
//! - **schema**: native ⇄ function-call tool schema conversion
//! - **compact**: token estimation and history compaction strategies
//! - **memory**: cross-session memory store hooks
//! - **storage**: config / conversation / run-log adapter contracts
//! - **files**: byte storage for tool-produced artifacts
//! - **pricing**: per-model cost calculation
//! - **config**: the durable agent configuration record
//! - **logging**: the per-run logging scope
//! - **error**: the crate-wide error taxonomy

pub mod agent;
pub mod compact;
pub mod config;
pub mod error;
pub mod files;
pub mod logging;
pub mod memory;
pub mod pricing;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod storage;
pub mod streaming;
pub mod tools;
pub mod types;

// --- Core agent API ---

pub use agent::{Agent, AgentBuilder, AgentState, FrontendToolResult, RunOutcome};

// --- Configuration ---

pub use config::{
    AgentConfig, AgentConfigBuilder, CompactorKind, FormatterKind, MemoryStoreKind,
    PendingFrontendTool,
};

// --- Error handling ---

pub use error::{Error, ErrorKind, Result};

// --- Provider abstraction ---

pub use provider::{HttpProviderClient, ProviderClient, ProviderRequest, StreamEvent};

// --- Streaming ---

pub use streaming::{OUTPUT_CHANNEL_CAPACITY, OutputReceiver, OutputSender, output_channel};

// --- Tool system ---

pub use tools::{
    ScopedToAgent, ToolDescriptor, ToolExecutor, ToolOutput, ToolPart, ToolRegistry,
};

// --- Core types ---

pub use types::{
    ContentBlock, ImageRef, Message, ProviderMessage, Role, StepUsage, StopReason, TextBlock,
    ToolResultBlock, ToolUseBlock, Usage,
};

/// Convenience module with the most commonly used types and functions.
/// Import with `use relay_agent::prelude::*;`.
pub mod prelude {
    pub use crate::agent::{Agent, AgentState, FrontendToolResult, RunOutcome};
    pub use crate::config::{AgentConfig, CompactorKind, FormatterKind, MemoryStoreKind};
    pub use crate::error::{Error, Result};
    pub use crate::provider::{HttpProviderClient, ProviderClient};
    pub use crate::streaming::output_channel;
    pub use crate::tools::{ToolDescriptor, ToolOutput, ToolRegistry};
    pub use crate::types::{ContentBlock, Message, StopReason};
}
