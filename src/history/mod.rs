//! Persistent chat-history store with a document/file dual backend.
//!
//! Grounded on `chat_history_manager.py`'s `ChatHistoryManager`: lazy,
//! single-flight, timeout-bounded backend selection on first use, with a
//! record-capped JSON file as the always-available fallback.

pub mod document;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::persist::FlatFileStore;
pub use document::DocumentBackend;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistoryRecord {
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatHistoryRecord {
    pub fn new(
        conversation_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<RecordMetadata>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

enum Backend {
    Document(Arc<dyn DocumentBackend>),
    File,
}

struct InitState {
    backend: Option<Backend>,
}

/// Dual-backend append-only history log. Backend selection happens lazily,
/// on first `save` or `get`, and is cached for the store's lifetime.
pub struct HistoryStore {
    document_backend: Option<Arc<dyn DocumentBackend>>,
    testing_mode: bool,
    probe_timeout: std::time::Duration,
    file: FlatFileStore<ChatHistoryRecord>,
    init: Mutex<InitState>,
}

impl HistoryStore {
    pub fn new(
        file_path: PathBuf,
        record_cap: usize,
        document_backend: Option<Arc<dyn DocumentBackend>>,
        probe_timeout: std::time::Duration,
    ) -> Self {
        Self {
            document_backend,
            testing_mode: false,
            probe_timeout,
            file: FlatFileStore::new(file_path, Some(record_cap)),
            init: Mutex::new(InitState { backend: None }),
        }
    }

    /// Force the file backend unconditionally, skipping the document probe
    /// (used by tests that want deterministic backend selection).
    pub fn with_testing_mode(mut self, testing_mode: bool) -> Self {
        self.testing_mode = testing_mode;
        self
    }

    /// Single-flight lazy backend selection. Safe to call repeatedly; only
    /// the first caller actually probes.
    async fn ensure_initialized(&self) -> Backend {
        let mut state = self.init.lock().await;
        if let Some(backend) = &state.backend {
            return clone_backend(backend);
        }

        let selected = if self.testing_mode {
            Backend::File
        } else if let Some(document) = &self.document_backend {
            match timeout(self.probe_timeout, document.ping()).await {
                Ok(Ok(())) => {
                    log::info!("history store: document backend reachable, selected");
                    Backend::Document(document.clone())
                }
                Ok(Err(err)) => {
                    log::warn!("history store: document backend ping failed ({err}); falling back to file");
                    Backend::File
                }
                Err(_) => {
                    log::warn!("history store: document backend ping timed out; falling back to file");
                    Backend::File
                }
            }
        } else {
            Backend::File
        };

        state.backend = Some(clone_backend(&selected));
        selected
    }

    pub async fn save(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        metadata: Option<RecordMetadata>,
    ) -> Result<(), HistoryError> {
        let record = ChatHistoryRecord::new(conversation_id, role, content, metadata);
        match self.ensure_initialized().await {
            Backend::Document(document) => {
                if let Err(err) = document.save(record.clone()).await {
                    log::warn!("history store: document save failed ({err}); writing to file instead");
                    self.save_to_file(record)?;
                }
            }
            Backend::File => self.save_to_file(record)?,
        }
        Ok(())
    }

    fn save_to_file(&self, record: ChatHistoryRecord) -> Result<(), HistoryError> {
        self.file.update(|records| records.push(record))?;
        Ok(())
    }

    pub async fn get(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatHistoryRecord>, HistoryError> {
        match self.ensure_initialized().await {
            Backend::Document(document) => match document.get(conversation_id, limit).await {
                Ok(records) => Ok(records),
                Err(err) => {
                    log::warn!("history store: document get failed ({err}); reading file instead");
                    self.get_from_file(conversation_id, limit)
                }
            },
            Backend::File => self.get_from_file(conversation_id, limit),
        }
    }

    fn get_from_file(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatHistoryRecord>, HistoryError> {
        let all = self.file.read_all()?;
        let matching: Vec<_> = all
            .into_iter()
            .filter(|r| r.conversation_id == conversation_id)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }
}

fn clone_backend(backend: &Backend) -> Backend {
    match backend {
        Backend::Document(d) => Backend::Document(d.clone()),
        Backend::File => Backend::File,
    }
}

#[cfg(test)]
mod tests {
    use super::document::InMemoryDocumentBackend;
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn testing_mode_forces_file_backend() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(
            dir.path().join("history.json"),
            1000,
            Some(Arc::new(InMemoryDocumentBackend::new())),
            Duration::from_millis(500),
        )
        .with_testing_mode(true);

        store.save("c1", "user", "hi", None).await.unwrap();
        let records = store.get("c1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "hi");
    }

    #[tokio::test]
    async fn reachable_document_backend_is_selected() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(
            dir.path().join("history.json"),
            1000,
            Some(Arc::new(InMemoryDocumentBackend::new())),
            Duration::from_millis(500),
        );

        store.save("c1", "user", "hi", None).await.unwrap();
        let records = store.get("c1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "hi");
    }

    #[tokio::test]
    async fn no_configured_backend_falls_back_to_file() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"), 1000, None, Duration::from_millis(500));
        store.save("c1", "assistant", "ok", None).await.unwrap();
        let records = store.get("c1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, "assistant");
    }

    #[tokio::test]
    async fn get_respects_limit_and_filters_conversation() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"), 1000, None, Duration::from_millis(500))
            .with_testing_mode(true);
        for i in 0..5 {
            store
                .save("c1", "user", &format!("msg {i}"), None)
                .await
                .unwrap();
        }
        store.save("other", "user", "noise", None).await.unwrap();

        let records = store.get("c1", 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "msg 3");
        assert_eq!(records[1].content, "msg 4");
    }
}
