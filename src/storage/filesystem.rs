//! Flat-file storage adapters.
//!
//! Directory layout under the base path:
//!
//! ```text
//! {base_path}/
//!     agent_config/
//!         {agent_uuid}.json
//!     conversation_history/
//!         {agent_uuid}/
//!             001.json
//!             002.json
//!             index.json
//!     agent_runs/
//!         {agent_uuid}/
//!             {run_id}.jsonl
//! ```
//!
//! Config saves are atomic: content is written to a `.tmp` sibling and
//! renamed into place, so a concurrent reader never observes a torn file
//! and `save` is read-your-writes. Conversation sequence numbers come from
//! `index.json`, which is only ever touched by the owning agent (single
//! writer per `agent_uuid`).

use super::{
    ConfigStore, ConversationRecord, ConversationStore, RunLogEvent, RunLogStore, SessionSummary,
};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

fn io_err(context: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::storage(format!("{context} {}: {e}", path.display()))
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| io_err("write", &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_err("rename", path, e))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let value = serde_json::from_str(&content)
                .map_err(|e| io_err("parse", path, e))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err("read", path, e)),
    }
}

// ============================================================================
// CONFIG STORE
// ============================================================================

/// Filesystem [`ConfigStore`]: one JSON file per agent.
pub struct FilesystemConfigStore {
    config_dir: PathBuf,
}

impl FilesystemConfigStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: base_path.into().join("agent_config"),
        }
    }

    fn config_path(&self, agent_uuid: &str) -> PathBuf {
        self.config_dir.join(format!("{agent_uuid}.json"))
    }
}

#[async_trait]
impl ConfigStore for FilesystemConfigStore {
    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| io_err("create", &self.config_dir, e))
    }

    async fn save(&self, config: &AgentConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        write_atomic(&self.config_path(&config.agent_uuid), &content).await?;
        log::debug!(
            "saved agent config agent={} backend=filesystem",
            config.agent_uuid
        );
        Ok(())
    }

    async fn load(&self, agent_uuid: &str) -> Result<Option<AgentConfig>> {
        read_json(&self.config_path(agent_uuid)).await
    }

    async fn delete(&self, agent_uuid: &str) -> Result<bool> {
        let path = self.config_path(agent_uuid);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("delete", &path, e)),
        }
    }

    async fn set_title(&self, agent_uuid: &str, title: &str) -> Result<bool> {
        match self.load(agent_uuid).await? {
            Some(mut config) => {
                config.title = Some(title.to_string());
                self.save(&config).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<(Vec<SessionSummary>, usize)> {
        let mut dir = match tokio::fs::read_dir(&self.config_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(io_err("read dir", &self.config_dir, e)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_err("read dir", &self.config_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<AgentConfig>(&path).await {
                Ok(Some(config)) => sessions.push(SessionSummary {
                    agent_uuid: config.agent_uuid,
                    title: config.title,
                    created_at: config.created_at,
                    updated_at: config.updated_at,
                    total_runs: config.total_runs,
                }),
                Ok(None) => {}
                Err(e) => {
                    // One corrupt file should not hide every other session.
                    log::warn!("skipping unreadable config {}: {e}", path.display());
                }
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = sessions.len();
        let page = sessions.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }
}

// ============================================================================
// CONVERSATION STORE
// ============================================================================

#[derive(serde::Serialize, serde::Deserialize)]
struct ConversationIndex {
    last_sequence: u64,
    total_conversations: u64,
    updated_at: String,
}

/// Filesystem [`ConversationStore`]: one JSON file per record with an
/// `index.json` tracking the sequence counter.
pub struct FilesystemConversationStore {
    conv_dir: PathBuf,
}

impl FilesystemConversationStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            conv_dir: base_path.into().join("conversation_history"),
        }
    }

    fn agent_dir(&self, agent_uuid: &str) -> PathBuf {
        self.conv_dir.join(agent_uuid)
    }

    /// Numeric record files sorted by sequence descending.
    async fn record_paths_desc(&self, agent_uuid: &str) -> Result<Vec<(u64, PathBuf)>> {
        let agent_dir = self.agent_dir(agent_uuid);
        let mut dir = match tokio::fs::read_dir(&agent_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("read dir", &agent_dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_err("read dir", &agent_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                paths.push((seq, path));
            }
        }
        paths.sort_by_key(|(seq, _)| std::cmp::Reverse(*seq));
        Ok(paths)
    }
}

#[async_trait]
impl ConversationStore for FilesystemConversationStore {
    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.conv_dir)
            .await
            .map_err(|e| io_err("create", &self.conv_dir, e))
    }

    async fn save(&self, record: &mut ConversationRecord) -> Result<()> {
        let agent_dir = self.agent_dir(&record.agent_uuid);
        tokio::fs::create_dir_all(&agent_dir)
            .await
            .map_err(|e| io_err("create", &agent_dir, e))?;

        let index_path = agent_dir.join("index.json");
        let last_sequence = read_json::<ConversationIndex>(&index_path)
            .await?
            .map_or(0, |index| index.last_sequence);
        let next_sequence = last_sequence + 1;
        record.sequence_number = Some(next_sequence);

        let record_path = agent_dir.join(format!("{next_sequence:03}.json"));
        write_atomic(&record_path, &serde_json::to_string_pretty(record)?).await?;

        let index = ConversationIndex {
            last_sequence: next_sequence,
            total_conversations: next_sequence,
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        write_atomic(&index_path, &serde_json::to_string_pretty(&index)?).await?;

        log::debug!(
            "saved conversation agent={} seq={next_sequence} backend=filesystem",
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
        let paths = self.record_paths_desc(agent_uuid).await?;
        let mut records = Vec::new();
        for (_, path) in paths.into_iter().skip(offset).take(limit) {
            if let Some(record) = read_json(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load_cursor(
        &self,
        agent_uuid: &str,
        before_seq: Option<u64>,
        limit: usize,
    ) -> Result<(Vec<ConversationRecord>, bool)> {
        let mut paths = self.record_paths_desc(agent_uuid).await?;
        if let Some(before) = before_seq {
            paths.retain(|(seq, _)| *seq < before);
        }

        let has_more = paths.len() > limit;
        let mut records = Vec::new();
        for (_, path) in paths.into_iter().take(limit) {
            if let Some(record) = read_json(&path).await? {
                records.push(record);
            }
        }
        Ok((records, has_more))
    }
}

// ============================================================================
// RUN LOG STORE
// ============================================================================

/// Filesystem [`RunLogStore`]: one JSONL file per run.
pub struct FilesystemRunLogStore {
    runs_dir: PathBuf,
}

impl FilesystemRunLogStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: base_path.into().join("agent_runs"),
        }
    }

    fn log_path(&self, agent_uuid: &str, run_id: &str) -> PathBuf {
        self.runs_dir.join(agent_uuid).join(format!("{run_id}.jsonl"))
    }
}

#[async_trait]
impl RunLogStore for FilesystemRunLogStore {
    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.runs_dir)
            .await
            .map_err(|e| io_err("create", &self.runs_dir, e))
    }

    async fn save(&self, agent_uuid: &str, run_id: &str, events: &[RunLogEvent]) -> Result<()> {
        let path = self.log_path(agent_uuid, run_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create", parent, e))?;
        }

        let mut content = String::new();
        for event in events {
            content.push_str(&serde_json::to_string(event)?);
            content.push('\n');
        }

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_err("write", &path, e))
    }

    async fn load(&self, agent_uuid: &str, run_id: &str) -> Result<Vec<RunLogEvent>> {
        let path = self.log_path(agent_uuid, run_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("read", &path, e)),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}
