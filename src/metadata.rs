//! Arbitrary per-file metadata posted by the frontend.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::RwLock;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, filename: &str) -> Option<Map<String, Value>>;

    async fn put(&self, filename: String, metadata: Map<String, Value>);
}

/// Keeps everything in memory, lost on restart
#[derive(Default)]
pub struct MemoryMetadataStore {
    entries: RwLock<HashMap<String, Map<String, Value>>>,
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, filename: &str) -> Option<Map<String, Value>> {
        self.entries.read().await.get(filename).cloned()
    }

    async fn put(&self, filename: String, metadata: Map<String, Value>) {
        tracing::trace!("Storing metadata for {filename}");

        self.entries.write().await.insert(filename, metadata);
    }
}
