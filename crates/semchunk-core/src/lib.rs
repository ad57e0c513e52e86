//! Semchunk Core Library
//!
//! An embedding-backed store for semantic chunks: SQLite rows, an
//! inverted-file vector index kept consistent with them, and a planner that
//! combines attribute filters with similarity search.

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod index;
pub mod planner;
pub mod query;
pub mod service;
pub mod storage;
pub mod sweep;

#[cfg(test)]
pub mod testutils;

pub use chunk::{Chunk, ChunkId, ChunkType, ParentId};
pub use config::StoreConfig;
pub use embedding::{Embedder, Embedding};
pub use error::{Error, Result};
pub use index::VectorIndex;
pub use query::{ChunkFilter, ChunkQuery};
pub use service::{ChunkService, QueryResult, ScoredChunk};
