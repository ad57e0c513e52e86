use crate::chunk::{Chunk, ChunkId};
use crate::embedding::Embedding;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A chunk with its distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine distance, 0 for an identical direction
    pub distance: f32,
    /// `1 - distance`
    pub similarity: f32,
}

impl ScoredChunk {
    pub fn new(chunk: Chunk, distance: f32) -> Self {
        Self {
            chunk,
            distance,
            similarity: 1.0 - distance,
        }
    }
}

/// How the planner answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryStrategy {
    /// Filtered rows scored exactly; the index was not consulted.
    ExactScan { candidates: usize },
    /// Index searched, then filtered. `fetched` is the last k' requested.
    IndexProbe { attempts: usize, fetched: usize },
}

/// Ranked query output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Nearest first
    pub hits: Vec<ScoredChunk>,
    pub requested: usize,
    pub strategy: QueryStrategy,
    /// A search deadline cut the index scan short
    pub partial: bool,
}

impl QueryResult {
    /// Whether as many hits as requested were found.
    pub fn is_complete(&self) -> bool {
        self.hits.len() >= self.requested
    }

    /// The hits, or `InsufficientResults` when fewer than requested survived.
    pub fn into_complete(self) -> Result<Vec<ScoredChunk>> {
        if self.is_complete() {
            Ok(self.hits)
        } else {
            Err(Error::InsufficientResults {
                requested: self.requested,
                found: self.hits.len(),
            })
        }
    }

    /// Ranked chunks without scores.
    pub fn into_chunks(self) -> Vec<Chunk> {
        self.hits.into_iter().map(|hit| hit.chunk).collect()
    }
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub id: ChunkId,
    /// Stored without an embedding; not searchable until one is attached
    pub pending_embedding: bool,
}

/// One chunk of a batch ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub chunk_type: String,
    pub content: String,
    #[serde(default)]
    pub embedding: Option<Embedding>,
    /// Estimated from the content when absent
    #[serde(default)]
    pub token_count: Option<u32>,
}

impl ChunkDraft {
    pub fn new(chunk_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            chunk_type: chunk_type.into(),
            content: content.into(),
            embedding: None,
            token_count: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }
}
