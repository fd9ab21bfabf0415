//! Cache worker lifecycle: install, activate, control messages.

use super::{CacheStorage, TileCache};
use crate::error::StorageError;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Parsed = 0,
    Installed = 1,
    Activated = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Installed,
            2 => WorkerState::Activated,
            _ => WorkerState::Parsed,
        }
    }
}

/// Control messages posted to the worker by pages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
}

impl WorkerMessage {
    /// Messages that are not recognised are ignored.
    pub fn parse(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

pub struct CacheWorker {
    cache: Arc<TileCache>,
    prefix: String,
    state: AtomicU8,
    skip_waiting: AtomicBool,
    clients_claimed: AtomicBool,
}

impl CacheWorker {
    pub fn new(cache: Arc<TileCache>, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
            state: AtomicU8::new(WorkerState::Parsed as u8),
            skip_waiting: AtomicBool::new(false),
            clients_claimed: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether this worker takes over without waiting for old clients to close.
    pub fn skips_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    pub fn install(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
        self.state
            .store(WorkerState::Installed as u8, Ordering::SeqCst);
        debug!("Tile cache worker installed");
    }

    /// Delete every other store sharing the prefix, then claim clients.
    ///
    /// Returns the names of the deleted stores.
    pub async fn activate(&self) -> Result<Vec<String>, StorageError> {
        let current = self.cache.store_name();
        let storage: &dyn CacheStorage = self.cache.storage().as_ref();

        let mut deleted = Vec::new();
        for name in storage.store_names().await? {
            if name.starts_with(&self.prefix) && name != current {
                storage.delete_store(&name).await?;
                deleted.push(name);
            }
        }

        self.state
            .store(WorkerState::Activated as u8, Ordering::SeqCst);
        self.clients_claimed.store(true, Ordering::SeqCst);
        info!(
            "Tile cache {} active, removed {} old stores",
            current,
            deleted.len()
        );
        Ok(deleted)
    }

    /// Returns whether the message was acted on.
    pub fn on_message(&self, payload: &Value) -> bool {
        match WorkerMessage::parse(payload) {
            Some(WorkerMessage::SkipWaiting) => {
                self.skip_waiting.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TileCacheConfig;
    use crate::context::PageOrigin;
    use crate::error::NetworkError;
    use crate::host::{FetchRequest, FetchResponse, Network};
    use crate::tile_cache::{CacheKey, MemoryStorage};
    use async_trait::async_trait;
    use serde_json::json;

    struct Offline;

    #[async_trait]
    impl Network for Offline {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError> {
            Err(NetworkError::Transport {
                url: request.url,
                reason: "offline".into(),
            })
        }
    }

    fn worker(storage: Arc<MemoryStorage>) -> CacheWorker {
        let cache = TileCache::new(
            PageOrigin::parse("https://mirror.example").unwrap(),
            TileCacheConfig::default(),
            storage,
            Arc::new(Offline),
        );
        CacheWorker::new(Arc::new(cache), "bom-map-tiles-")
    }

    #[tokio::test]
    async fn test_activation_rotates_old_stores() {
        let storage = Arc::new(MemoryStorage::new());
        let key = CacheKey::new("GET", "https://mirror.example/overlays/a.png");
        let entry = FetchResponse::new(200, "https://mirror.example/overlays/a.png");
        for store in ["bom-map-tiles-v0", "bom-map-tiles-v1", "unrelated"] {
            storage.put(store, &key, &entry).await.unwrap();
        }

        let worker = worker(storage.clone());
        worker.install();
        assert_eq!(worker.state(), WorkerState::Installed);
        assert!(worker.skips_waiting());

        let deleted = worker.activate().await.unwrap();
        assert_eq!(deleted, vec!["bom-map-tiles-v0".to_string()]);
        assert_eq!(worker.state(), WorkerState::Activated);
        assert!(worker.clients_claimed());

        let mut remaining = storage.store_names().await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec!["bom-map-tiles-v1", "unrelated"]);
        assert!(storage.is_empty("bom-map-tiles-v0"));
        assert_eq!(storage.len("bom-map-tiles-v1"), 1);
    }

    #[test]
    fn test_skip_waiting_message() {
        let worker = worker(Arc::new(MemoryStorage::new()));
        assert!(!worker.on_message(&json!({ "type": "CLAIM" })));
        assert!(!worker.on_message(&json!("SKIP_WAITING")));
        assert!(!worker.skips_waiting());

        assert!(worker.on_message(&json!({ "type": "SKIP_WAITING" })));
        assert!(worker.skips_waiting());
    }
}
