//! Chunk types for semantic content.

use crate::embedding::Embedding;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a stored chunk. Assigned by the store, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub i64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the owning subtopic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentId(pub i64);

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of semantic chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    /// Statement of what something is
    Definition,
    /// Worked or illustrative example
    Example,
    /// Real-world use of an idea
    Application,
    /// Steps of a method
    Procedure,
    /// General concept summary
    Concept,
}

impl ChunkType {
    /// Every chunk type, in declaration order.
    pub const ALL: [ChunkType; 5] = [
        ChunkType::Definition,
        ChunkType::Example,
        ChunkType::Application,
        ChunkType::Procedure,
        ChunkType::Concept,
    ];

    /// Get the type name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Definition => "definition",
            ChunkType::Example => "example",
            ChunkType::Application => "application",
            ChunkType::Procedure => "procedure",
            ChunkType::Concept => "concept",
        }
    }
}

impl FromStr for ChunkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "definition" => Ok(ChunkType::Definition),
            "example" => Ok(ChunkType::Example),
            "application" => Ok(ChunkType::Application),
            "procedure" => Ok(ChunkType::Procedure),
            "concept" => Ok(ChunkType::Concept),
            other => Err(Error::Validation(format!("unknown chunk type: {:?}", other))),
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A semantic chunk of subtopic content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Store-assigned id; `None` until the chunk is persisted
    pub id: Option<ChunkId>,
    /// Owning subtopic
    pub parent_id: ParentId,
    /// Kind of chunk
    pub chunk_type: ChunkType,
    /// The chunk text
    pub content: String,
    /// Embedding, absent while the chunk awaits one
    pub embedding: Option<Embedding>,
    /// Token count, 0 when unknown
    pub token_count: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Create a new, unsaved chunk.
    pub fn new(parent_id: ParentId, chunk_type: ChunkType, content: impl Into<String>) -> Self {
        Self {
            id: None,
            parent_id,
            chunk_type,
            content: content.into(),
            embedding: None,
            token_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Set the embedding.
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Set the token count.
    pub fn with_token_count(mut self, token_count: u32) -> Self {
        self.token_count = token_count;
        self
    }

    /// Set the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether the chunk still waits for its embedding.
    pub fn is_pending(&self) -> bool {
        self.embedding.is_none()
    }

    /// Check the write-time invariants that do not depend on the store.
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(Error::Validation("chunk content must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Rough token estimate: whitespace-separated words.
pub fn estimate_tokens(content: &str) -> u32 {
    u32::try_from(content.split_whitespace().count()).unwrap_or(u32::MAX)
}
