//! Serialisable form of the vector index.

use crate::chunk::ChunkId;
use serde::{Deserialize, Serialize};

/// Centroids plus per-cluster postings, tombstones already dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub dimensions: usize,
    pub generation: u64,
    /// Empty for an untrained index
    pub centroids: Vec<Vec<f32>>,
    pub postings: Vec<Posting>,
}

/// One indexed vector and the cluster it was assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: ChunkId,
    pub cluster: usize,
    pub vector: Vec<f32>,
}

impl PersistedIndex {
    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }
}
