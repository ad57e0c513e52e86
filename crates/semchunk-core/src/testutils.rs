//! Test utilities for Semchunk.
//!
//! Provides reusable test helpers and fixtures.

use crate::chunk::{Chunk, ChunkId, ChunkType, ParentId};
use crate::config::{IndexConfig, StoreConfig};
use crate::embedding::{Embedder, Embedding};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::query::ChunkFilter;
use crate::storage::{CardinalityStats, ChunkStore, SqliteStorage};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Test fixture for creating sample chunks and vectors.
pub struct TestFixtures;

impl TestFixtures {
    /// A chunk without an embedding.
    pub fn chunk(parent: i64, chunk_type: ChunkType, content: &str) -> Chunk {
        Chunk::new(ParentId(parent), chunk_type, content)
    }

    /// Unit vector along `axis`.
    pub fn axis(dimensions: usize, axis: usize) -> Embedding {
        let mut vector = vec![0.0; dimensions];
        vector[axis % dimensions] = 1.0;
        Embedding::new(vector)
    }

    /// Deterministic uniform vectors in `[-1, 1)`.
    pub fn random_vectors(n: usize, dimensions: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dimensions).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect()
    }

    /// `n` vectors scattered tightly around `clusters` random centres.
    pub fn clustered_vectors(
        n: usize,
        dimensions: usize,
        clusters: usize,
        seed: u64,
    ) -> Vec<Vec<f32>> {
        let centres = Self::random_vectors(clusters, dimensions, seed);
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        (0..n)
            .map(|i| {
                centres[i % clusters]
                    .iter()
                    .map(|c| c + rng.random_range(-0.05..0.05))
                    .collect()
            })
            .collect()
    }
}

/// Embedder that maps text to a vector from its byte histogram.
pub struct HashEmbedder {
    pub dimensions: usize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("fail-embed") {
            return Err(Error::Embedding("refused".to_string()));
        }
        let mut vector = vec![0.0; self.dimensions];
        for (i, byte) in text.bytes().enumerate() {
            vector[(byte as usize + i) % self.dimensions] += 1.0;
        }
        Ok(Embedding::new(vector))
    }
}

/// In-memory store that lets a second writer act between two steps of an
/// operation under test.
pub struct InterleavingStore {
    inner: SqliteStorage,
    /// Delete each row right after `put` returns its id.
    pub delete_after_put: AtomicBool,
    /// Delete the row right after `attach_embedding` succeeds.
    pub delete_after_attach: AtomicBool,
    /// Stored and indexed once `embedded_ids` has taken its snapshot.
    after_snapshot: Mutex<Option<(Chunk, Arc<VectorIndex>)>>,
    /// Ids written by the `after_snapshot` writer.
    pub written: Mutex<Vec<ChunkId>>,
}

impl InterleavingStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            inner: test_storage(dimensions),
            delete_after_put: AtomicBool::new(false),
            delete_after_attach: AtomicBool::new(false),
            after_snapshot: Mutex::new(None),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Ingest `chunk` into the store and `index` right after the next
    /// `embedded_ids` snapshot.
    pub fn ingest_after_snapshot(&self, chunk: Chunk, index: Arc<VectorIndex>) {
        *self.after_snapshot.lock() = Some((chunk, index));
    }
}

#[async_trait]
impl ChunkStore for InterleavingStore {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn put(&self, chunk: &Chunk) -> Result<ChunkId> {
        let id = self.inner.put(chunk).await?;
        if self.delete_after_put.load(Ordering::SeqCst) {
            self.inner.delete(id).await?;
        }
        Ok(id)
    }

    async fn get(&self, id: ChunkId) -> Result<Chunk> {
        self.inner.get(id).await
    }

    async fn get_many(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        self.inner.get_many(ids).await
    }

    async fn delete(&self, id: ChunkId) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn delete_by_parent(&self, parent_id: ParentId) -> Result<Vec<ChunkId>> {
        self.inner.delete_by_parent(parent_id).await
    }

    async fn list_by_parent(&self, parent_id: ParentId) -> Result<Vec<Chunk>> {
        self.inner.list_by_parent(parent_id).await
    }

    async fn attach_embedding(&self, id: ChunkId, embedding: &Embedding) -> Result<()> {
        self.inner.attach_embedding(id, embedding).await?;
        if self.delete_after_attach.load(Ordering::SeqCst) {
            self.inner.delete(id).await?;
        }
        Ok(())
    }

    async fn find(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>> {
        self.inner.find(filter).await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Chunk>> {
        self.inner.pending(limit).await
    }

    async fn embedded_ids(&self) -> Result<Vec<ChunkId>> {
        let snapshot = self.inner.embedded_ids().await?;
        let writer = self.after_snapshot.lock().take();
        if let Some((chunk, index)) = writer {
            let id = self.inner.put(&chunk).await?;
            if let Some(embedding) = &chunk.embedding {
                index.insert(id, &embedding.vector)?;
            }
            self.written.lock().push(id);
        }
        Ok(snapshot)
    }

    async fn embedding(&self, id: ChunkId) -> Result<Option<Embedding>> {
        self.inner.embedding(id).await
    }

    async fn stats(&self) -> Result<CardinalityStats> {
        self.inner.stats().await
    }

    async fn type_counts(&self, parents: &[ParentId]) -> Result<BTreeMap<ChunkType, usize>> {
        self.inner.type_counts(parents).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// Create a temporary in-memory storage for testing.
pub fn test_storage(dimensions: usize) -> SqliteStorage {
    SqliteStorage::in_memory(dimensions).expect("Failed to create in-memory storage")
}

/// Small-index configuration that trains after a few dozen vectors.
pub fn test_config(dimensions: usize) -> StoreConfig {
    let mut config = StoreConfig::with_dimensions(dimensions);
    config.index = IndexConfig {
        min_train_size: 32,
        retrain_after_inserts: 10_000,
        ..IndexConfig::default()
    };
    config.ingest.retry_backoff_ms = 1;
    config
}

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clustered_vectors_fixture() {
        let vectors = TestFixtures::clustered_vectors(10, 4, 2, 7);
        assert_eq!(vectors.len(), 10);
        assert!(vectors.iter().all(|v| v.len() == 4));
        assert_eq!(vectors, TestFixtures::clustered_vectors(10, 4, 2, 7));
    }

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(8);
        let a = embedder.embed("a set").unwrap();
        assert_eq!(a, embedder.embed("a set").unwrap());
        assert_eq!(a.dimensions(), 8);
        assert!(embedder.embed("fail-embed").is_err());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }
}
