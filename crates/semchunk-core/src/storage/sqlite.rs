//! SQLite storage backend implementation.

use crate::chunk::{Chunk, ChunkId, ChunkType, ParentId};
use crate::embedding::Embedding;
use crate::error::{Error, Result};
use crate::index::{PersistedIndex, Posting};
use crate::query::ChunkFilter;
use crate::storage::traits::{CardinalityStats, ChunkStore, IndexStore};
use crate::storage::utils::{blob_to_vector, format_timestamp, parse_timestamp, vector_to_blob};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const CHUNK_COLUMNS: &str =
    "id, parent_id, chunk_type, content, embedding, token_count, created_at";

/// Ids bound per statement, below SQLite's default variable limit.
const MAX_BOUND_PARAMS: usize = 500;

/// `?first, ?first+1, ...` for `n` parameters.
fn placeholders(first: usize, n: usize) -> String {
    (first..first + n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    dimensions: usize,
}

impl SqliteStorage {
    /// Create a new SQLite storage at the given path.
    pub fn new(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let storage = Self {
            conn: Mutex::new(conn),
            dimensions,
        };
        storage.init_schema()?;
        storage.check_dimensions()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub fn in_memory(dimensions: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
            dimensions,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            -- Chunk rows
            CREATE TABLE IF NOT EXISTS content_chunks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id       INTEGER NOT NULL,
                chunk_type      TEXT NOT NULL CHECK (chunk_type IN
                                    ('definition', 'example', 'application', 'procedure', 'concept')),
                content         TEXT NOT NULL CHECK (length(content) > 0),
                embedding       BLOB,
                dimensions      INTEGER,
                token_count     INTEGER NOT NULL DEFAULT 0 CHECK (token_count >= 0),
                created_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_parent ON content_chunks(parent_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_type ON content_chunks(chunk_type);

            -- Persisted vector index
            CREATE TABLE IF NOT EXISTS index_centroids (
                cluster         INTEGER PRIMARY KEY,
                vector          BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS index_postings (
                chunk_id        INTEGER PRIMARY KEY,
                cluster         INTEGER NOT NULL,
                vector          BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS index_meta (
                key             TEXT PRIMARY KEY,
                value           TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Refuse to open a database written with another dimensionality.
    fn check_dimensions(&self) -> Result<()> {
        let conn = self.conn.lock();
        let other: Option<i64> = conn
            .query_row(
                "SELECT dimensions FROM content_chunks \
                 WHERE dimensions IS NOT NULL AND dimensions != ?1 LIMIT 1",
                params![self.dimensions as i64],
                |row| row.get(0),
            )
            .optional()?;
        match other {
            Some(found) => Err(Error::Config(format!(
                "database holds {}-dimensional embeddings, configured for {}",
                found, self.dimensions
            ))),
            None => Ok(()),
        }
    }
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let id: i64 = row.get(0)?;
    let parent_id: i64 = row.get(1)?;
    let type_str: String = row.get(2)?;
    let content: String = row.get(3)?;
    let embedding: Option<Vec<u8>> = row.get(4)?;
    let token_count: i64 = row.get(5)?;
    let created_str: String = row.get(6)?;

    // Rows are validated on write; this guards against foreign writers.
    let chunk_type = type_str
        .parse::<ChunkType>()
        .map_err(|e| conversion_error(2, e))?;
    let created_at = parse_timestamp(&created_str).map_err(|e| conversion_error(6, e))?;

    Ok(Chunk {
        id: Some(ChunkId(id)),
        parent_id: ParentId(parent_id),
        chunk_type,
        content,
        embedding: embedding.map(|bytes| Embedding::new(blob_to_vector(&bytes))),
        token_count: u32::try_from(token_count).unwrap_or(0),
        created_at,
    })
}

#[async_trait]
impl ChunkStore for SqliteStorage {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn put(&self, chunk: &Chunk) -> Result<ChunkId> {
        chunk.validate()?;
        if let Some(embedding) = &chunk.embedding {
            embedding.check(self.dimensions)?;
        }

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO content_chunks
            (id, parent_id, chunk_type, content, embedding, dimensions, token_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                chunk.id.map(|id| id.0),
                chunk.parent_id.0,
                chunk.chunk_type.as_str(),
                chunk.content,
                chunk.embedding.as_ref().map(|e| vector_to_blob(&e.vector)),
                chunk.embedding.as_ref().map(|e| e.dimensions() as i64),
                chunk.token_count as i64,
                format_timestamp(&chunk.created_at),
            ],
        )?;
        let id = ChunkId(conn.last_insert_rowid());
        debug!(%id, parent = %chunk.parent_id, kind = %chunk.chunk_type, "stored chunk");
        Ok(id)
    }

    async fn get(&self, id: ChunkId) -> Result<Chunk> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM content_chunks WHERE id = ?1",
            CHUNK_COLUMNS
        ))?;
        stmt.query_row(params![id.0], row_to_chunk)
            .optional()?
            .ok_or_else(|| Error::not_found_chunk(id))
    }

    async fn get_many(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM content_chunks WHERE id = ?1",
            CHUNK_COLUMNS
        ))?;
        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(chunk) = stmt.query_row(params![id.0], row_to_chunk).optional()? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    async fn delete(&self, id: ChunkId) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM content_chunks WHERE id = ?1", params![id.0])?;
        if affected == 0 {
            return Err(Error::not_found_chunk(id));
        }
        Ok(())
    }

    async fn delete_by_parent(&self, parent_id: ParentId) -> Result<Vec<ChunkId>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt =
                tx.prepare("SELECT id FROM content_chunks WHERE parent_id = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![parent_id.0], |row| row.get::<_, i64>(0).map(ChunkId))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        tx.execute(
            "DELETE FROM content_chunks WHERE parent_id = ?1",
            params![parent_id.0],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    async fn list_by_parent(&self, parent_id: ParentId) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM content_chunks WHERE parent_id = ?1 ORDER BY created_at, id",
            CHUNK_COLUMNS
        ))?;
        let chunks = stmt
            .query_map(params![parent_id.0], row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    async fn attach_embedding(&self, id: ChunkId, embedding: &Embedding) -> Result<()> {
        embedding.check(self.dimensions)?;

        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE content_chunks SET embedding = ?1, dimensions = ?2 \
             WHERE id = ?3 AND embedding IS NULL",
            params![
                vector_to_blob(&embedding.vector),
                embedding.dimensions() as i64,
                id.0
            ],
        )?;
        if affected == 1 {
            return Ok(());
        }

        let embedded: Option<bool> = conn
            .query_row(
                "SELECT embedding IS NOT NULL FROM content_chunks WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        match embedded {
            None => Err(Error::not_found_chunk(id)),
            Some(_) => Err(Error::Validation(format!(
                "chunk {} already has an embedding",
                id
            ))),
        }
    }

    async fn find(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>> {
        if filter.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let mut base = format!(
            "SELECT {} FROM content_chunks WHERE embedding IS NOT NULL",
            CHUNK_COLUMNS
        );
        let mut values: Vec<Value> = Vec::new();
        if let Some(chunk_type) = filter.chunk_type {
            values.push(Value::Text(chunk_type.as_str().to_string()));
            base.push_str(" AND chunk_type = ?1");
        }

        let conn = self.conn.lock();
        let Some(parent_ids) = &filter.parent_ids else {
            let mut stmt = conn.prepare(&format!("{} ORDER BY id", base))?;
            let chunks = stmt
                .query_map(params_from_iter(values.iter()), row_to_chunk)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            return Ok(chunks);
        };

        let mut chunks = Vec::new();
        for batch in parent_ids.chunks(MAX_BOUND_PARAMS) {
            let first = values.len() + 1;
            let sql = format!(
                "{} AND parent_id IN ({})",
                base,
                placeholders(first, batch.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let bound = values
                .iter()
                .cloned()
                .chain(batch.iter().map(|p| Value::Integer(p.0)));
            let rows = stmt.query_map(params_from_iter(bound), row_to_chunk)?;
            for row in rows {
                chunks.push(row?);
            }
        }
        chunks.sort_by_key(|c| c.id);
        Ok(chunks)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM content_chunks WHERE embedding IS NULL \
             ORDER BY created_at, id LIMIT ?1",
            CHUNK_COLUMNS
        ))?;
        let chunks = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    async fn embedded_ids(&self) -> Result<Vec<ChunkId>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id FROM content_chunks WHERE embedding IS NOT NULL ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(ChunkId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    async fn embedding(&self, id: ChunkId) -> Result<Option<Embedding>> {
        let conn = self.conn.lock();
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT embedding FROM content_chunks WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.flatten().map(|bytes| Embedding::new(blob_to_vector(&bytes))))
    }

    async fn stats(&self) -> Result<CardinalityStats> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_chunks WHERE embedding IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let mut by_parent = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT parent_id, COUNT(*) FROM content_chunks \
             WHERE embedding IS NOT NULL GROUP BY parent_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (parent, count) = row?;
            by_parent.insert(ParentId(parent), count as usize);
        }

        let mut by_type = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT chunk_type, COUNT(*) FROM content_chunks \
             WHERE embedding IS NOT NULL GROUP BY chunk_type",
        )?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(0)?;
            let kind = kind.parse::<ChunkType>().map_err(|e| conversion_error(0, e))?;
            Ok((kind, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            by_type.insert(kind, count as usize);
        }

        Ok(CardinalityStats {
            total_embedded: total as usize,
            by_parent,
            by_type,
        })
    }

    async fn type_counts(&self, parents: &[ParentId]) -> Result<BTreeMap<ChunkType, usize>> {
        let conn = self.conn.lock();
        let mut counts = BTreeMap::new();
        let mut tally = |sql: &str, ids: &[ParentId]| -> Result<()> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter().map(|p| p.0)), |row| {
                let kind: String = row.get(0)?;
                let kind = kind.parse::<ChunkType>().map_err(|e| conversion_error(0, e))?;
                Ok((kind, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (kind, count) = row?;
                *counts.entry(kind).or_insert(0) += count as usize;
            }
            Ok(())
        };

        if parents.is_empty() {
            tally("SELECT chunk_type, COUNT(*) FROM content_chunks GROUP BY chunk_type", &[])?;
        } else {
            let mut unique = parents.to_vec();
            unique.sort_unstable();
            unique.dedup();
            for batch in unique.chunks(MAX_BOUND_PARAMS) {
                let sql = format!(
                    "SELECT chunk_type, COUNT(*) FROM content_chunks \
                     WHERE parent_id IN ({}) GROUP BY chunk_type",
                    placeholders(1, batch.len())
                );
                tally(&sql, batch)?;
            }
        }
        Ok(counts)
    }

    async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM content_chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl IndexStore for SqliteStorage {
    async fn save_index(&self, index: &PersistedIndex) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM index_centroids", [])?;
        tx.execute("DELETE FROM index_postings", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO index_centroids (cluster, vector) VALUES (?1, ?2)")?;
            for (cluster, centroid) in index.centroids.iter().enumerate() {
                stmt.execute(params![cluster as i64, vector_to_blob(centroid)])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO index_postings (chunk_id, cluster, vector) VALUES (?1, ?2, ?3)",
            )?;
            for posting in &index.postings {
                stmt.execute(params![
                    posting.id.0,
                    posting.cluster as i64,
                    vector_to_blob(&posting.vector)
                ])?;
            }

            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?1, ?2)")?;
            stmt.execute(params!["dimensions", index.dimensions.to_string()])?;
            stmt.execute(params!["generation", index.generation.to_string()])?;
        }
        tx.commit()?;
        debug!(
            postings = index.postings.len(),
            clusters = index.centroids.len(),
            "saved vector index"
        );
        Ok(())
    }

    async fn load_index(&self) -> Result<Option<PersistedIndex>> {
        let conn = self.conn.lock();
        let meta = |key: &str| -> Result<Option<String>> {
            Ok(conn
                .query_row(
                    "SELECT value FROM index_meta WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        };

        let Some(dimensions) = meta("dimensions")? else {
            return Ok(None);
        };
        let dimensions = dimensions
            .parse::<usize>()
            .map_err(|_| {
                Error::IndexInconsistency(format!("bad stored dimensions {:?}", dimensions))
            })?;
        let generation = meta("generation")?
            .and_then(|g| g.parse::<u64>().ok())
            .unwrap_or(0);

        let mut stmt = conn.prepare("SELECT vector FROM index_centroids ORDER BY cluster")?;
        let centroids = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .map(|r| r.map(|bytes| blob_to_vector(&bytes)))
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT chunk_id, cluster, vector FROM index_postings ORDER BY cluster, chunk_id",
        )?;
        let postings = stmt
            .query_map([], |row| {
                Ok(Posting {
                    id: ChunkId(row.get(0)?),
                    cluster: row.get::<_, i64>(1)? as usize,
                    vector: blob_to_vector(&row.get::<_, Vec<u8>>(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(PersistedIndex {
            dimensions,
            generation,
            centroids,
            postings,
        }))
    }
}
