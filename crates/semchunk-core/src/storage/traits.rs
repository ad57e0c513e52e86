//! Storage trait definitions.

use crate::chunk::{Chunk, ChunkId, ChunkType, ParentId};
use crate::embedding::Embedding;
use crate::index::PersistedIndex;
use crate::query::ChunkFilter;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Approximate counts of searchable (embedded) chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardinalityStats {
    /// Chunks with an embedding
    pub total_embedded: usize,
    /// Embedded chunks per parent
    pub by_parent: HashMap<ParentId, usize>,
    /// Embedded chunks per type
    pub by_type: HashMap<ChunkType, usize>,
}

impl CardinalityStats {
    /// Estimated number of embedded chunks matching `filter`.
    ///
    /// With both attributes constrained the two marginals are treated as
    /// independent.
    pub fn estimate(&self, filter: &ChunkFilter) -> usize {
        let by_parent = filter.parent_ids.as_ref().map(|ids| {
            ids.iter()
                .map(|p| self.by_parent.get(p).copied().unwrap_or(0))
                .sum::<usize>()
        });
        let by_type = filter
            .chunk_type
            .map(|t| self.by_type.get(&t).copied().unwrap_or(0));

        match (by_parent, by_type) {
            (None, None) => self.total_embedded,
            (Some(n), None) | (None, Some(n)) => n,
            (Some(p), Some(t)) => {
                if self.total_embedded == 0 {
                    0
                } else {
                    let joint = (p as f64) * (t as f64) / (self.total_embedded as f64);
                    joint.ceil() as usize
                }
            }
        }
    }
}

/// Durable chunk row storage.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Embedding dimensionality this store accepts.
    fn dimensions(&self) -> usize;

    /// Store a new chunk, assigning an id when it has none.
    async fn put(&self, chunk: &Chunk) -> Result<ChunkId>;

    /// Retrieve a chunk; `NotFound` when absent.
    async fn get(&self, id: ChunkId) -> Result<Chunk>;

    /// Batch retrieval in the order of `ids`. Missing ids are skipped.
    async fn get_many(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>>;

    /// Remove a chunk; `NotFound` when absent.
    async fn delete(&self, id: ChunkId) -> Result<()>;

    /// Remove every chunk of a parent in one transaction, returning their ids.
    async fn delete_by_parent(&self, parent_id: ParentId) -> Result<Vec<ChunkId>>;

    /// Chunks of a parent, oldest first.
    async fn list_by_parent(&self, parent_id: ParentId) -> Result<Vec<Chunk>>;

    /// Fill in the embedding of a pending chunk.
    async fn attach_embedding(&self, id: ChunkId, embedding: &Embedding) -> Result<()>;

    /// Embedded chunks matching the filter.
    async fn find(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>>;

    /// Chunks still waiting for an embedding, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<Chunk>>;

    /// Ids of every embedded chunk, ascending.
    async fn embedded_ids(&self) -> Result<Vec<ChunkId>>;

    /// Embedding of a chunk; `None` when the row is missing or pending.
    async fn embedding(&self, id: ChunkId) -> Result<Option<Embedding>>;

    /// Cardinality statistics for query planning.
    async fn stats(&self) -> Result<CardinalityStats>;

    /// Chunk counts per type for the given parents (all chunks when empty).
    async fn type_counts(&self, parents: &[ParentId]) -> Result<BTreeMap<ChunkType, usize>>;

    /// Count total chunks.
    async fn count(&self) -> Result<usize>;
}

/// Persistence of the vector index snapshot.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Replace the stored snapshot.
    async fn save_index(&self, index: &PersistedIndex) -> Result<()>;

    /// Load the stored snapshot, if any.
    async fn load_index(&self) -> Result<Option<PersistedIndex>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> CardinalityStats {
        CardinalityStats {
            total_embedded: 100,
            by_parent: HashMap::from([(ParentId(1), 10), (ParentId(2), 90)]),
            by_type: HashMap::from([(ChunkType::Definition, 20), (ChunkType::Example, 80)]),
        }
    }

    #[test]
    fn test_estimate_single_filters() {
        let s = stats();
        assert_eq!(s.estimate(&ChunkFilter::default()), 100);
        assert_eq!(s.estimate(&ChunkFilter::parent(ParentId(1))), 10);
        assert_eq!(s.estimate(&ChunkFilter::parent(ParentId(3))), 0);
        assert_eq!(
            s.estimate(&ChunkFilter::default().with_type(ChunkType::Concept)),
            0
        );
    }

    #[test]
    fn test_estimate_combined_filters() {
        let s = stats();
        let filter = ChunkFilter::parent(ParentId(2)).with_type(ChunkType::Definition);
        assert_eq!(s.estimate(&filter), 18);
        assert_eq!(CardinalityStats::default().estimate(&filter), 0);
    }

    #[test]
    fn test_estimate_parent_set() {
        let s = stats();
        let both = ChunkFilter::parents([ParentId(1), ParentId(2), ParentId(7)]);
        assert_eq!(s.estimate(&both), 100);
        assert_eq!(s.estimate(&ChunkFilter::parents(std::iter::empty())), 0);
        assert_eq!(s.estimate(&both.with_type(ChunkType::Definition)), 20);
    }
}
