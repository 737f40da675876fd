//! In-memory storage adapters.
//!
//! Everything lives in maps behind mutexes: no durability, no I/O, perfect
//! for unit tests and throwaway agents. Sequence numbering and pagination
//! semantics match the durable adapters exactly so tests exercise the real
//! contracts.

use super::{
    ConfigStore, ConversationRecord, ConversationStore, RunLogEvent, RunLogStore, SessionSummary,
};
use crate::config::AgentConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory [`ConfigStore`].
#[derive(Default)]
pub struct MemoryConfigStore {
    data: Mutex<HashMap<String, AgentConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn save(&self, config: &AgentConfig) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(config.agent_uuid.clone(), config.clone());
        log::debug!("saved agent config agent={} backend=memory", config.agent_uuid);
        Ok(())
    }

    async fn load(&self, agent_uuid: &str) -> Result<Option<AgentConfig>> {
        Ok(self.data.lock().unwrap().get(agent_uuid).cloned())
    }

    async fn delete(&self, agent_uuid: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().remove(agent_uuid).is_some())
    }

    async fn set_title(&self, agent_uuid: &str, title: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        match data.get_mut(agent_uuid) {
            Some(config) => {
                config.title = Some(title.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<(Vec<SessionSummary>, usize)> {
        let data = self.data.lock().unwrap();
        let mut sessions: Vec<SessionSummary> = data
            .values()
            .map(|config| SessionSummary {
                agent_uuid: config.agent_uuid.clone(),
                title: config.title.clone(),
                created_at: config.created_at,
                updated_at: config.updated_at,
                total_runs: config.total_runs,
            })
            .collect();

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = sessions.len();
        let page = sessions.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }
}

/// In-memory [`ConversationStore`] with per-agent sequence counters.
#[derive(Default)]
pub struct MemoryConversationStore {
    data: Mutex<HashMap<String, Vec<ConversationRecord>>>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn save(&self, record: &mut ConversationRecord) -> Result<()> {
        let next_seq = {
            let mut sequences = self.sequences.lock().unwrap();
            let seq = sequences.entry(record.agent_uuid.clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        record.sequence_number = Some(next_seq);

        self.data
            .lock()
            .unwrap()
            .entry(record.agent_uuid.clone())
            .or_default()
            .push(record.clone());

        log::debug!(
            "saved conversation agent={} seq={next_seq} backend=memory",
            record.agent_uuid
        );
        Ok(())
    }

    async fn load_page(
        &self,
        agent_uuid: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationRecord>> {
        let data = self.data.lock().unwrap();
        let mut records = data.get(agent_uuid).cloned().unwrap_or_default();
        records.sort_by_key(|r| std::cmp::Reverse(r.sequence_number.unwrap_or(0)));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn load_cursor(
        &self,
        agent_uuid: &str,
        before_seq: Option<u64>,
        limit: usize,
    ) -> Result<(Vec<ConversationRecord>, bool)> {
        let data = self.data.lock().unwrap();
        let mut records = data.get(agent_uuid).cloned().unwrap_or_default();
        records.sort_by_key(|r| std::cmp::Reverse(r.sequence_number.unwrap_or(0)));

        if let Some(before) = before_seq {
            records.retain(|r| r.sequence_number.unwrap_or(0) < before);
        }

        let has_more = records.len() > limit;
        records.truncate(limit);
        Ok((records, has_more))
    }
}

/// In-memory [`RunLogStore`].
#[derive(Default)]
pub struct MemoryRunLogStore {
    data: Mutex<HashMap<(String, String), Vec<RunLogEvent>>>,
}

impl MemoryRunLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLogStore for MemoryRunLogStore {
    async fn save(&self, agent_uuid: &str, run_id: &str, events: &[RunLogEvent]) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert((agent_uuid.to_string(), run_id.to_string()), events.to_vec());
        Ok(())
    }

    async fn load(&self, agent_uuid: &str, run_id: &str) -> Result<Vec<RunLogEvent>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(&(agent_uuid.to_string(), run_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
