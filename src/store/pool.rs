//! C2 — vector-store handle pool.
//!
//! Keyed by `(collection, embedding_model, persist_directory)`. First
//! access lazily constructs the embedding model and opens the index;
//! subsequent accesses reuse the same handles. Entries whose last use
//! exceeds the configured idle TTL are dropped by `sweep_idle`.
//! Embedding models are cached separately by name, since the same model
//! is frequently shared across collections.
//!
//! Grounded in the teacher's `EmbeddingService` (`Arc<RwLock<HashMap<...>>>`
//! cache in `services/embedding_service.rs`), generalized from a flat
//! embedding cache into a keyed pool of full (embedder, index) handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::corpus::traits::{Embedder, VectorIndex};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub collection: String,
    pub embedding_model: String,
    pub persist_directory: String,
}

pub struct IndexHandle {
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    last_used: RwLock<Instant>,
}

impl IndexHandle {
    fn touch(&self) {
        *self.last_used.write() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.read().elapsed()
    }
}

/// A constructor for a fresh index handle, invoked only on a pool miss.
/// Failure surfaces directly to the caller; this layer never retries.
#[async_trait::async_trait]
pub trait IndexFactory: Send + Sync {
    async fn build(&self, key: &HandleKey) -> anyhow::Result<Arc<dyn VectorIndex>>;
}

#[async_trait::async_trait]
pub trait EmbedderFactory: Send + Sync {
    async fn build(&self, model_name: &str) -> anyhow::Result<Arc<dyn Embedder>>;
}

pub struct HandlePool {
    handles: RwLock<HashMap<HandleKey, Arc<IndexHandle>>>,
    embedders: RwLock<HashMap<String, Arc<dyn Embedder>>>,
    idle_ttl: Duration,
    index_factory: Arc<dyn IndexFactory>,
    embedder_factory: Arc<dyn EmbedderFactory>,
}

impl HandlePool {
    pub fn new(
        idle_ttl: Duration,
        index_factory: Arc<dyn IndexFactory>,
        embedder_factory: Arc<dyn EmbedderFactory>,
    ) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            embedders: RwLock::new(HashMap::new()),
            idle_ttl,
            index_factory,
            embedder_factory,
        }
    }

    async fn embedder_for(&self, model_name: &str) -> anyhow::Result<Arc<dyn Embedder>> {
        if let Some(existing) = self.embedders.read().get(model_name) {
            return Ok(existing.clone());
        }
        let built = self.embedder_factory.build(model_name).await?;
        self.embedders
            .write()
            .insert(model_name.to_string(), built.clone());
        Ok(built)
    }

    /// Returns the pooled handle for `key`, constructing it on first
    /// access. The embedding model referenced by `key.embedding_model` is
    /// looked up/constructed independently so it can be shared across
    /// collections that happen to use the same model.
    pub async fn get(&self, key: HandleKey) -> anyhow::Result<Arc<IndexHandle>> {
        if let Some(handle) = self.handles.read().get(&key) {
            handle.touch();
            return Ok(handle.clone());
        }

        let embedder = self.embedder_for(&key.embedding_model).await?;
        let index = self.index_factory.build(&key).await?;
        let handle = Arc::new(IndexHandle {
            index,
            embedder,
            last_used: RwLock::new(Instant::now()),
        });

        // Another concurrent caller may have won the race; prefer whichever
        // entry is already present to avoid holding two live handles.
        let mut handles = self.handles.write();
        let entry = handles.entry(key).or_insert_with(|| handle.clone());
        entry.touch();
        Ok(entry.clone())
    }

    /// Drops handles idle past `idle_ttl`. Intended to run on a periodic
    /// background tick, matching the LRU-style expiry SPEC_FULL.md §4.2
    /// describes.
    pub fn sweep_idle(&self) {
        let mut handles = self.handles.write();
        handles.retain(|_, handle| handle.idle_for() < self.idle_ttl);
    }

    pub fn active_handle_count(&self) -> usize {
        self.handles.read().len()
    }
}
