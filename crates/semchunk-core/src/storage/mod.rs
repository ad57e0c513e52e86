//! Storage abstraction layer.
//!
//! This module provides trait-based storage abstractions for chunk rows and
//! the persisted vector index, with SQLite as the backend.

mod sqlite;
mod traits;
mod utils;

pub use sqlite::SqliteStorage;
pub use traits::{CardinalityStats, ChunkStore, IndexStore};
