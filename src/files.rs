//! File backends: content-addressed byte storage for tool artifacts.
//!
//! Tools that produce images or documents hand the bytes to a
//! [`FileBackend`]; the agent streams a reference (id + location) to the
//! consumer while the API payload keeps the base64 content. Backends are
//! scoped by `(agent_uuid, file_id)` and replace bytes wholesale on
//! re-store.
//!
//! Two implementations ship with the crate: [`LocalFileBackend`] writes to
//! disk, [`NoopFileBackend`] discards everything (required for test
//! environments).

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Metadata returned by every file backend operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub filename: String,
    /// Opaque location: a path, a URL, or empty for no-op backends
    #[serde(default)]
    pub storage_location: Option<String>,
    pub size: u64,
    /// RFC 3339 timestamp of the write
    pub timestamp: String,
    /// Whether this write replaced existing bytes
    pub is_update: bool,
    /// Which backend produced this metadata ("local", "noop", …)
    pub backend_id: String,
    /// Size of the replaced content, on updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_size: Option<u64>,
    /// Backend-specific extension point
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, Value>,
}

/// Byte store for tool-produced artifacts, addressable by
/// `(agent_uuid, file_id)`.
///
/// Storing the same `file_id` twice is allowed; later writes fully replace
/// earlier bytes. Backends follow the open → use → close lifecycle and must
/// tolerate concurrent use from independent agents.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Initialize resources. Called once before first use.
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources. Called once at shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Store bytes for a new file id (or silently replace an existing one).
    async fn store(
        &self,
        file_id: &str,
        filename: &str,
        content: &[u8],
        agent_uuid: &str,
    ) -> Result<FileMetadata>;

    /// Replace an existing file's bytes, reporting the prior size.
    async fn update(
        &self,
        file_id: &str,
        filename: &str,
        content: &[u8],
        agent_uuid: &str,
    ) -> Result<FileMetadata>;

    /// Fetch a file's bytes, or `None` when it does not exist.
    async fn retrieve(&self, file_id: &str, agent_uuid: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a file. Returns true when something was deleted.
    async fn delete(&self, file_id: &str, agent_uuid: &str) -> Result<bool>;
}

// ============================================================================
// LOCAL DISK BACKEND
// ============================================================================

/// Disk-backed file storage under `{base_dir}/{agent_uuid}/files/{file_id}`.
pub struct LocalFileBackend {
    base_dir: PathBuf,
}

impl LocalFileBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn file_path(&self, agent_uuid: &str, file_id: &str) -> PathBuf {
        self.base_dir.join(agent_uuid).join("files").join(file_id)
    }

    async fn write(
        &self,
        file_id: &str,
        filename: &str,
        content: &[u8],
        agent_uuid: &str,
    ) -> Result<FileMetadata> {
        let path = self.file_path(agent_uuid, file_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("create {}: {e}", parent.display())))?;
        }

        let prior_size = match tokio::fs::metadata(&path).await {
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        };

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::storage(format!("write {}: {e}", path.display())))?;

        log::debug!(
            "stored file {file_id} ({} bytes) for agent {agent_uuid}",
            content.len()
        );

        Ok(FileMetadata {
            file_id: file_id.to_string(),
            filename: filename.to_string(),
            storage_location: Some(path.display().to_string()),
            size: content.len() as u64,
            timestamp: Utc::now().to_rfc3339(),
            is_update: prior_size.is_some(),
            backend_id: "local".to_string(),
            prior_size,
            extras: serde_json::Map::new(),
        })
    }
}

#[async_trait]
impl FileBackend for LocalFileBackend {
    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| Error::storage(format!("create {}: {e}", self.base_dir.display())))
    }

    async fn store(
        &self,
        file_id: &str,
        filename: &str,
        content: &[u8],
        agent_uuid: &str,
    ) -> Result<FileMetadata> {
        self.write(file_id, filename, content, agent_uuid).await
    }

    async fn update(
        &self,
        file_id: &str,
        filename: &str,
        content: &[u8],
        agent_uuid: &str,
    ) -> Result<FileMetadata> {
        self.write(file_id, filename, content, agent_uuid).await
    }

    async fn retrieve(&self, file_id: &str, agent_uuid: &str) -> Result<Option<Vec<u8>>> {
        let path = self.file_path(agent_uuid, file_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("read {}: {e}", path.display()))),
        }
    }

    async fn delete(&self, file_id: &str, agent_uuid: &str) -> Result<bool> {
        let path = self.file_path(agent_uuid, file_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage(format!("delete {}: {e}", path.display()))),
        }
    }
}

// ============================================================================
// NO-OP BACKEND
// ============================================================================

/// Backend that stores nothing. Operations succeed with empty locations so
/// the rest of the pipeline behaves normally in test environments.
#[derive(Debug, Default)]
pub struct NoopFileBackend;

impl NoopFileBackend {
    pub fn new() -> Self {
        Self
    }

    fn metadata(file_id: &str, filename: &str, size: u64) -> FileMetadata {
        FileMetadata {
            file_id: file_id.to_string(),
            filename: filename.to_string(),
            storage_location: None,
            size,
            timestamp: Utc::now().to_rfc3339(),
            is_update: false,
            backend_id: "noop".to_string(),
            prior_size: None,
            extras: serde_json::Map::new(),
        }
    }
}

#[async_trait]
impl FileBackend for NoopFileBackend {
    async fn store(
        &self,
        file_id: &str,
        filename: &str,
        content: &[u8],
        _agent_uuid: &str,
    ) -> Result<FileMetadata> {
        Ok(Self::metadata(file_id, filename, content.len() as u64))
    }

    async fn update(
        &self,
        file_id: &str,
        filename: &str,
        content: &[u8],
        _agent_uuid: &str,
    ) -> Result<FileMetadata> {
        let mut meta = Self::metadata(file_id, filename, content.len() as u64);
        meta.is_update = true;
        Ok(meta)
    }

    async fn retrieve(&self, _file_id: &str, _agent_uuid: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn delete(&self, _file_id: &str, _agent_uuid: &str) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_store_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path());
        backend.open().await.unwrap();

        let meta = backend
            .store("img_1", "img_1.png", b"bytes", "agent-1")
            .await
            .unwrap();
        assert_eq!(meta.size, 5);
        assert!(!meta.is_update);
        assert_eq!(meta.backend_id, "local");
        assert!(meta.storage_location.is_some());

        let bytes = backend.retrieve("img_1", "agent-1").await.unwrap();
        assert_eq!(bytes.as_deref(), Some(b"bytes".as_ref()));
    }

    #[tokio::test]
    async fn test_local_restore_replaces_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path());
        backend.open().await.unwrap();

        backend
            .store("f1", "f1.bin", b"first", "agent-1")
            .await
            .unwrap();
        let meta = backend
            .store("f1", "f1.bin", b"replacement", "agent-1")
            .await
            .unwrap();

        assert!(meta.is_update);
        assert_eq!(meta.prior_size, Some(5));
        assert_eq!(meta.size, 11);

        let bytes = backend.retrieve("f1", "agent-1").await.unwrap().unwrap();
        assert_eq!(bytes, b"replacement");
    }

    #[tokio::test]
    async fn test_local_files_are_scoped_by_agent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path());
        backend.open().await.unwrap();

        backend.store("f1", "f1.bin", b"a", "agent-a").await.unwrap();
        assert!(backend.retrieve("f1", "agent-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path());
        backend.open().await.unwrap();

        backend.store("f1", "f1.bin", b"a", "agent-1").await.unwrap();
        assert!(backend.delete("f1", "agent-1").await.unwrap());
        assert!(!backend.delete("f1", "agent-1").await.unwrap());
        assert!(backend.retrieve("f1", "agent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noop_backend_discards_everything() {
        let backend = NoopFileBackend::new();
        let meta = backend
            .store("f1", "f1.png", b"bytes", "agent-1")
            .await
            .unwrap();
        assert_eq!(meta.backend_id, "noop");
        assert!(meta.storage_location.is_none());
        assert_eq!(meta.size, 5);

        assert!(backend.retrieve("f1", "agent-1").await.unwrap().is_none());
        assert!(!backend.delete("f1", "agent-1").await.unwrap());
    }
}
