//! Keyed pool of long-lived stdio MCP clients.
//!
//! Grounded on the teacher pack's MCP connection pool
//! (`lightseekorg-smg/mcp/src/core/pool.rs`), which caches `RunningService`
//! handles behind an LRU keyed by transport identity. This cache has no
//! bound on distinct keys (they are O(configured servers), per spec), and
//! replaces the pool's `Mutex<LruCache<..>>` check-then-insert with a
//! `DashMap` of `OnceCell`s so that concurrent callers on the same cold key
//! genuinely single-flight onto one spawn rather than racing.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::error::BrokerError;
use super::transport::stdio::StdioClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StdioKey {
    pub command: String,
    pub alias: String,
    pub config_dir: Option<String>,
}

#[derive(Default)]
pub struct StdioClientCache {
    entries: DashMap<StdioKey, Arc<OnceCell<Arc<StdioClient>>>>,
}

impl StdioClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `key`, spawning one on a cold miss.
    /// Concurrent callers racing on the same cold key share one spawn.
    pub async fn get_or_create(&self, key: StdioKey) -> Result<Arc<StdioClient>, BrokerError> {
        let cell = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(|| async { StdioClient::spawn(&key).await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Evict and shut down the entry for `key`, if present. Shutdown errors
    /// are logged, not propagated: a stuck subprocess should not block the
    /// caller from getting a fresh one on the next `get_or_create`.
    pub async fn remove(&self, key: &StdioKey) {
        let Some((_, cell)) = self.entries.remove(key) else {
            return;
        };
        if let Some(client) = cell.get() {
            if let Err(err) = client.shutdown().await {
                log::warn!("stdio cache: error shutting down {:?}: {}", key, err);
            }
        }
    }

    pub async fn close_all(&self) {
        let keys: Vec<StdioKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key).await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_get_or_create_single_flights_one_spawn() {
        static SPAWNS: AtomicUsize = AtomicUsize::new(0);
        SPAWNS.store(0, Ordering::SeqCst);

        let cache = Arc::new(StdioClientCache::new());
        let key = StdioKey {
            command: "true".into(),
            alias: "noop".into(),
            config_dir: None,
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.get_or_create(key).await }));
        }

        let mut pointers = Vec::new();
        for h in handles {
            let client = h.await.unwrap().expect("spawn should succeed for `true`");
            pointers.push(Arc::as_ptr(&client) as usize);
        }

        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn remove_allows_respawn_under_new_key_instance() {
        let cache = StdioClientCache::new();
        let key = StdioKey {
            command: "true".into(),
            alias: "noop".into(),
            config_dir: None,
        };
        cache.get_or_create(key.clone()).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.remove(&key).await;
        assert!(cache.is_empty());
        cache.get_or_create(key).await.unwrap();
        assert_eq!(cache.len(), 1);
    }
}
