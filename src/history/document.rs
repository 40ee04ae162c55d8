//! The document-store side of the history store's dual backend.
//!
//! This crate does not vendor a concrete document-database driver. Instead
//! this is a trait boundary a host could plug a real driver into, plus a
//! lightweight in-memory stub used where "a document backend happened to
//! be reachable" needs to be exercised in tests without a real database.

use async_trait::async_trait;

use super::{ChatHistoryRecord, HistoryError};

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Connectivity check run once during `ensure_initialized`.
    async fn ping(&self) -> Result<(), HistoryError>;

    async fn save(&self, record: ChatHistoryRecord) -> Result<(), HistoryError>;

    async fn get(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatHistoryRecord>, HistoryError>;
}

/// An always-reachable, process-local stand-in for a real document store.
/// Useful for exercising the "document backend selected" path in tests
/// without a database; not durable across process restarts.
#[derive(Default)]
pub struct InMemoryDocumentBackend {
    records: tokio::sync::Mutex<Vec<ChatHistoryRecord>>,
}

impl InMemoryDocumentBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentBackend for InMemoryDocumentBackend {
    async fn ping(&self) -> Result<(), HistoryError> {
        Ok(())
    }

    async fn save(&self, record: ChatHistoryRecord) -> Result<(), HistoryError> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn get(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatHistoryRecord>, HistoryError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect())
    }
}
