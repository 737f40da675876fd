//! Storage adapter contracts and durable record types.
//!
//! Three independently pluggable adapters persist the agent's state:
//!
//! - [`ConfigStore`] — the [`AgentConfig`] checkpoint (one per agent).
//! - [`ConversationStore`] — one [`ConversationRecord`] per run, with
//!   adapter-assigned, strictly increasing sequence numbers.
//! - [`RunLogStore`] — the timestamped [`RunLogEvent`] lines for each run.
//!
//! All adapters are async and follow an open → use → close lifecycle; the
//! agent opens them once, never per call. Adapters must be safe for
//! concurrent use across agents, but a single `agent_uuid` always has a
//! single writer (its agent instance).
//!
//! Two reference implementations ship with the crate: [`memory`] for tests
//! and [`filesystem`] for durable flat-file storage with atomic writes.

pub mod filesystem;
pub mod memory;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::pricing::CostBreakdown;
use crate::types::{Message, StepUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// RECORD TYPES
// ============================================================================

/// One user turn and everything the agent did with it: the assistant
/// responses, per-step usage, cost, and the adapter-assigned sequence
/// number that orders records within an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Unique record id
    pub conversation_id: String,
    pub agent_uuid: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// The user prompt that started the run
    pub user_message: String,
    /// Final assistant text, when the run produced one
    #[serde(default)]
    pub final_response: Option<String>,
    /// Messages appended to history during this run
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Terminal reason: end_turn, max_tokens, awaiting_frontend_tools, …
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub total_steps: u32,
    /// Per-step token usage
    #[serde(default)]
    pub usage: Vec<StepUsage>,
    /// Total cost breakdown, when the model has known pricing
    #[serde(default)]
    pub cost: Option<CostBreakdown>,
    /// Assigned by the conversation store on save: 1, 2, … per agent with
    /// no gaps
    #[serde(default)]
    pub sequence_number: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// Start a record for a new run.
    pub fn start(
        agent_uuid: impl Into<String>,
        run_id: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            agent_uuid: agent_uuid.into(),
            run_id: run_id.into(),
            started_at: now,
            completed_at: None,
            user_message: user_message.into(),
            final_response: None,
            messages: Vec::new(),
            stop_reason: None,
            total_steps: 0,
            usage: Vec::new(),
            cost: None,
            sequence_number: None,
            created_at: now,
        }
    }
}

/// Lightweight listing entry for an agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub agent_uuid: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_runs: u64,
}

/// The event types a run log line can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLogEventType {
    StepStart,
    StepEnd,
    ToolCall,
    ToolResult,
    Compaction,
    Retry,
    Error,
    Finish,
}

/// One timestamped line of a run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: RunLogEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RunLogEvent {
    fn base(event_type: RunLogEventType) -> Self {
        Self {
            ts: Utc::now(),
            event_type,
            step: None,
            tool_name: None,
            tool_use_id: None,
            error_kind: None,
            delay_seconds: None,
            details: None,
        }
    }

    pub fn step_start(step: u32) -> Self {
        Self {
            step: Some(step),
            ..Self::base(RunLogEventType::StepStart)
        }
    }

    pub fn step_end(step: u32, details: Value) -> Self {
        Self {
            step: Some(step),
            details: Some(details),
            ..Self::base(RunLogEventType::StepEnd)
        }
    }

    pub fn tool_call(step: u32, name: &str, tool_use_id: &str) -> Self {
        Self {
            step: Some(step),
            tool_name: Some(name.to_string()),
            tool_use_id: Some(tool_use_id.to_string()),
            ..Self::base(RunLogEventType::ToolCall)
        }
    }

    pub fn tool_result(step: u32, name: &str, tool_use_id: &str, is_error: bool) -> Self {
        Self {
            step: Some(step),
            tool_name: Some(name.to_string()),
            tool_use_id: Some(tool_use_id.to_string()),
            details: Some(serde_json::json!({"is_error": is_error})),
            ..Self::base(RunLogEventType::ToolResult)
        }
    }

    pub fn compaction(step: u32, details: Value) -> Self {
        Self {
            step: Some(step),
            details: Some(details),
            ..Self::base(RunLogEventType::Compaction)
        }
    }

    pub fn retry(step: Option<u32>, attempt: u32, error_kind: &str, delay_seconds: f64) -> Self {
        Self {
            step,
            error_kind: Some(error_kind.to_string()),
            delay_seconds: Some(delay_seconds),
            details: Some(serde_json::json!({"attempt": attempt})),
            ..Self::base(RunLogEventType::Retry)
        }
    }

    pub fn error(error_kind: &str, details: Value) -> Self {
        Self {
            error_kind: Some(error_kind.to_string()),
            details: Some(details),
            ..Self::base(RunLogEventType::Error)
        }
    }

    pub fn finish(details: Value) -> Self {
        Self {
            details: Some(details),
            ..Self::base(RunLogEventType::Finish)
        }
    }
}

// ============================================================================
// ADAPTER CONTRACTS
// ============================================================================

/// Durable store for agent configs, keyed by `agent_uuid`.
///
/// `save` must be read-your-writes: a `load` issued after `save` returns
/// observes the saved config. Writers use temp-file-and-rename or a
/// transactional equivalent.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Initialize resources (directories, connections). Called once.
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources. Called once at shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, config: &AgentConfig) -> Result<()>;

    async fn load(&self, agent_uuid: &str) -> Result<Option<AgentConfig>>;

    /// Returns true when something was deleted.
    async fn delete(&self, agent_uuid: &str) -> Result<bool>;

    /// Returns false when the agent does not exist.
    async fn set_title(&self, agent_uuid: &str, title: &str) -> Result<bool>;

    /// Page of sessions sorted by `updated_at` descending, plus the total
    /// session count.
    async fn list(&self, limit: usize, offset: usize) -> Result<(Vec<SessionSummary>, usize)>;
}

/// Durable store for conversation records.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Persist a record, assigning the next sequence number for its agent
    /// (strictly increasing, no gaps). The assigned number is written back
    /// into the record.
    async fn save(&self, record: &mut ConversationRecord) -> Result<()>;

    /// Offset pagination, newest first.
    async fn load_page(
        &self,
        agent_uuid: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationRecord>>;

    /// Cursor pagination, newest first: records with sequence numbers below
    /// `before_seq` (all when `None`), plus a has-more flag.
    async fn load_cursor(
        &self,
        agent_uuid: &str,
        before_seq: Option<u64>,
        limit: usize,
    ) -> Result<(Vec<ConversationRecord>, bool)>;
}

/// Durable store for per-run log lines.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, agent_uuid: &str, run_id: &str, events: &[RunLogEvent]) -> Result<()>;

    async fn load(&self, agent_uuid: &str, run_id: &str) -> Result<Vec<RunLogEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_log_event_json_shape() {
        let event = RunLogEvent::retry(Some(2), 1, "rate_limited", 5.3);
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "retry");
        assert_eq!(v["step"], 2);
        assert_eq!(v["error_kind"], "rate_limited");
        assert_eq!(v["delay_seconds"], 5.3);
        assert_eq!(v["details"]["attempt"], 1);
        assert!(v.get("tool_name").is_none());
        assert!(v.get("ts").is_some());
    }

    #[test]
    fn test_event_type_names() {
        let event = RunLogEvent::step_start(1);
        assert_eq!(
            serde_json::to_value(&event).unwrap()["type"],
            "step_start"
        );
        let event = RunLogEvent::finish(serde_json::json!({"stop_reason": "end_turn"}));
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "finish");
    }

    #[test]
    fn test_conversation_record_start() {
        let record = ConversationRecord::start("agent-1", "run-1", "hello");
        assert_eq!(record.agent_uuid, "agent-1");
        assert_eq!(record.user_message, "hello");
        assert!(record.sequence_number.is_none());
        assert!(record.completed_at.is_none());
        assert!(!record.conversation_id.is_empty());
    }

    #[test]
    fn test_record_round_trip() {
        let mut record = ConversationRecord::start("a", "r", "hi");
        record.sequence_number = Some(3);
        record.stop_reason = Some("end_turn".into());
        let json = serde_json::to_string(&record).unwrap();
        let back: ConversationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
