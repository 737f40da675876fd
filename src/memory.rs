//! Cross-session memory stores.
//!
//! Memory stores operate strictly at run boundaries: `retrieve` just before
//! the first request of a run, to inject relevant prior knowledge as
//! transient context messages (never added to durable history), and
//! `update` after a run completes, to extract learnings for future runs.
//!
//! They are independent of context compaction: a compactor manages
//! within-session context size, a memory store manages across-session
//! knowledge.

use crate::config::MemoryStoreKind;
use crate::error::Result;
use crate::types::Message;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Contract for memory store implementations.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Called once per run, after the user message joins history. Returns
    /// transient context messages appended to the request only — they must
    /// never land in durable history.
    async fn retrieve(
        &self,
        tools: &[Value],
        user_message: &Message,
        messages: &[Message],
        model: &str,
    ) -> Result<Vec<Message>>;

    /// Called after a run completes. Returns metadata recorded in the run
    /// log (created/updated counts and the like).
    async fn update(
        &self,
        messages: &[Message],
        conversation_history: &[Message],
        tools: &[Value],
        model: &str,
    ) -> Result<Value>;
}

/// Build the memory store selected by an agent config.
pub fn memory_store_for(kind: MemoryStoreKind) -> Box<dyn MemoryStore> {
    match kind {
        MemoryStoreKind::None => Box::new(NoOpMemoryStore),
        MemoryStoreKind::Placeholder => Box::new(PlaceholderMemoryStore::new(5)),
    }
}

/// Memory store that does nothing. The baseline, and the default.
pub struct NoOpMemoryStore;

#[async_trait]
impl MemoryStore for NoOpMemoryStore {
    async fn retrieve(
        &self,
        _tools: &[Value],
        _user_message: &Message,
        _messages: &[Message],
        _model: &str,
    ) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn update(
        &self,
        _messages: &[Message],
        _conversation_history: &[Message],
        _tools: &[Value],
        _model: &str,
    ) -> Result<Value> {
        Ok(json!({
            "store_type": "none",
            "memories_created": 0,
            "memories_updated": 0,
        }))
    }
}

/// Stub store that exercises the integration without real storage. Serves
/// as the template for vector/semantic implementations.
pub struct PlaceholderMemoryStore {
    /// Number of memories a real implementation would retrieve
    pub top_k: usize,
}

impl PlaceholderMemoryStore {
    pub fn new(top_k: usize) -> Self {
        log::info!("placeholder memory store initialized, top_k={top_k}");
        Self { top_k }
    }
}

#[async_trait]
impl MemoryStore for PlaceholderMemoryStore {
    async fn retrieve(
        &self,
        _tools: &[Value],
        user_message: &Message,
        _messages: &[Message],
        _model: &str,
    ) -> Result<Vec<Message>> {
        log::debug!(
            "placeholder memory retrieve for prompt: {:.60}",
            user_message.text()
        );
        Ok(Vec::new())
    }

    async fn update(
        &self,
        _messages: &[Message],
        conversation_history: &[Message],
        _tools: &[Value],
        _model: &str,
    ) -> Result<Value> {
        log::debug!(
            "placeholder memory update over {} history messages",
            conversation_history.len()
        );
        Ok(json!({
            "store_type": "placeholder",
            "memories_created": 0,
            "memories_updated": 0,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_injects_nothing() {
        let store = NoOpMemoryStore;
        let user = Message::user("hello");
        let injected = store.retrieve(&[], &user, &[], "claude-sonnet-4-5").await.unwrap();
        assert!(injected.is_empty());

        let meta = store.update(&[], &[], &[], "claude-sonnet-4-5").await.unwrap();
        assert_eq!(meta["store_type"], "none");
        assert_eq!(meta["memories_created"], 0);
    }

    #[tokio::test]
    async fn test_placeholder_reports_its_type() {
        let store = PlaceholderMemoryStore::new(3);
        assert_eq!(store.top_k, 3);

        let meta = store.update(&[], &[], &[], "claude-sonnet-4-5").await.unwrap();
        assert_eq!(meta["store_type"], "placeholder");
        assert!(meta.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_selector() {
        let store = memory_store_for(MemoryStoreKind::None);
        let meta = store.update(&[], &[], &[], "m").await.unwrap();
        assert_eq!(meta["store_type"], "none");

        let store = memory_store_for(MemoryStoreKind::Placeholder);
        let meta = store.update(&[], &[], &[], "m").await.unwrap();
        assert_eq!(meta["store_type"], "placeholder");
    }
}
