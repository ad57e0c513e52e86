pub mod context;
pub mod coverage;
pub mod models;

use crate::chunk::{Chunk, ChunkId, ParentId};
use crate::config::StoreConfig;
use crate::embedding::{Embedder, Embedding};
use crate::error::Result;
use crate::gateway::IngestGateway;
use crate::index::{IndexStats, RetrainReport, VectorIndex};
use crate::planner::QueryPlanner;
use crate::query::{ChunkFilter, ChunkQuery};
use crate::storage::{ChunkStore, IndexStore, SqliteStorage};
use crate::sweep::{reconcile, SweepReport};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use context::{format_context, summarize, ContextOptions, DEFAULT_CONTEXT_HITS};
pub use coverage::CoverageReport;
pub use models::*;

/// The chunk store with its index, planner and write path wired together.
pub struct ChunkService {
    storage: Arc<SqliteStorage>,
    index: Arc<VectorIndex>,
    gateway: IngestGateway,
    planner: QueryPlanner,
    config: StoreConfig,
}

impl ChunkService {
    /// Open (or create) a database file.
    ///
    /// The persisted index is loaded when it matches the configured
    /// dimensionality and rebuilt from the rows otherwise. A consistency sweep
    /// runs before the service is returned.
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let storage = SqliteStorage::new(path, config.dimensions)?;
        Self::assemble(storage, config).await
    }

    /// A service backed by an in-memory database.
    pub async fn in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let storage = SqliteStorage::in_memory(config.dimensions)?;
        Self::assemble(storage, config).await
    }

    async fn assemble(storage: SqliteStorage, config: StoreConfig) -> Result<Self> {
        let storage = Arc::new(storage);
        let dimensions = config.dimensions;

        let index = match storage.load_index().await? {
            Some(persisted) if persisted.dimensions == dimensions => {
                match VectorIndex::restore(dimensions, config.index.clone(), persisted) {
                    Ok(index) => index,
                    Err(e) => {
                        warn!(error = %e, "persisted index unusable, rebuilding from rows");
                        VectorIndex::new(dimensions, config.index.clone())
                    }
                }
            }
            Some(persisted) => {
                warn!(
                    stored = persisted.dimensions,
                    configured = dimensions,
                    "persisted index has other dimensions, rebuilding from rows"
                );
                VectorIndex::new(dimensions, config.index.clone())
            }
            None => VectorIndex::new(dimensions, config.index.clone()),
        };
        let index = Arc::new(index);

        let report = reconcile(storage.as_ref(), &index).await?;
        info!(
            live = index.len(),
            orphans_removed = report.orphans_removed,
            missing_restored = report.missing_restored,
            "chunk service ready"
        );

        let store: Arc<dyn ChunkStore> = storage.clone();
        let gateway =
            IngestGateway::new(Arc::clone(&store), Arc::clone(&index), config.ingest.clone());
        let planner = QueryPlanner::new(store, Arc::clone(&index), config.planner.clone());

        let service = Self {
            storage,
            index,
            gateway,
            planner,
            config,
        };
        if service.config.index.auto_retrain {
            service.schedule_retrain();
        }
        Ok(service)
    }

    /// Use `embedder` for batch ingest and pending embeddings.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.gateway = self.gateway.with_embedder(embedder);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn storage(&self) -> &Arc<SqliteStorage> {
        &self.storage
    }

    pub async fn ingest(
        &self,
        parent_id: ParentId,
        chunk_type: &str,
        content: &str,
        embedding: Option<Embedding>,
    ) -> Result<IngestReceipt> {
        let receipt = self.gateway.ingest(parent_id, chunk_type, content, embedding).await?;
        self.after_write();
        Ok(receipt)
    }

    pub async fn ingest_with_tokens(
        &self,
        parent_id: ParentId,
        chunk_type: &str,
        content: &str,
        embedding: Option<Embedding>,
        token_count: u32,
    ) -> Result<IngestReceipt> {
        let receipt = self
            .gateway
            .ingest_with_tokens(parent_id, chunk_type, content, embedding, Some(token_count))
            .await?;
        self.after_write();
        Ok(receipt)
    }

    pub async fn ingest_batch(
        &self,
        parent_id: ParentId,
        drafts: Vec<ChunkDraft>,
    ) -> Result<Vec<IngestReceipt>> {
        let receipts = self.gateway.ingest_batch(parent_id, drafts).await?;
        self.after_write();
        Ok(receipts)
    }

    pub async fn attach_embedding(&self, id: ChunkId, embedding: Embedding) -> Result<()> {
        let result = self.gateway.attach_embedding(id, embedding).await;
        self.after_write();
        result
    }

    pub async fn embed_pending(&self, limit: usize) -> Result<usize> {
        let attached = self.gateway.embed_pending(limit).await?;
        self.after_write();
        Ok(attached)
    }

    pub async fn retry_deferred(&self) -> Result<usize> {
        self.gateway.retry_deferred().await
    }

    pub async fn delete(&self, id: ChunkId) -> Result<()> {
        self.gateway.delete(id).await?;
        self.after_write();
        Ok(())
    }

    pub async fn delete_parent(&self, parent_id: ParentId) -> Result<Vec<ChunkId>> {
        let ids = self.gateway.delete_parent(parent_id).await?;
        self.after_write();
        Ok(ids)
    }

    pub async fn get(&self, id: ChunkId) -> Result<Chunk> {
        self.storage.get(id).await
    }

    pub async fn list_by_parent(&self, parent_id: ParentId) -> Result<Vec<Chunk>> {
        self.storage.list_by_parent(parent_id).await
    }

    /// Up to `k` chunks nearest to `embedding` among those matching `filter`.
    pub async fn query(
        &self,
        filter: &ChunkFilter,
        embedding: &Embedding,
        k: usize,
    ) -> Result<QueryResult> {
        self.planner.query(filter, embedding, k).await
    }

    pub async fn run(&self, query: &ChunkQuery, embedding: &Embedding) -> Result<QueryResult> {
        self.planner.run(query, embedding).await
    }

    /// Parse a filter expression such as `parent:1 type:definition limit:5`
    /// and run it.
    pub async fn search(&self, expression: &str, embedding: &Embedding) -> Result<QueryResult> {
        let query = ChunkQuery::parse(expression)?;
        self.planner.run(&query, embedding).await
    }

    /// Up to `k` chunks of the `earlier` subtopics nearest to `embedding`.
    /// No earlier subtopics means no context.
    pub async fn find_context(
        &self,
        earlier: &[ParentId],
        embedding: &Embedding,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let filter = ChunkFilter::parents(earlier.iter().copied());
        let result = self.planner.query(&filter, embedding, k).await?;
        Ok(result.hits)
    }

    /// Context text for the next subtopic: the nearest earlier chunks grouped
    /// by type, then the end of the previous subtopic.
    pub async fn assemble_context(
        &self,
        earlier: &[ParentId],
        embedding: &Embedding,
        previous: Option<&str>,
        options: &ContextOptions,
    ) -> Result<String> {
        let hits = self.find_context(earlier, embedding, DEFAULT_CONTEXT_HITS).await?;
        Ok(format_context(&hits, previous, options))
    }

    /// Chunk-type balance of the given parents; all chunks when empty.
    pub async fn coverage(&self, parents: &[ParentId]) -> Result<CoverageReport> {
        let counts = self.storage.type_counts(parents).await?;
        Ok(CoverageReport::from_counts(counts))
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let report = reconcile(self.storage.as_ref(), &self.index).await?;
        if !report.is_clean() {
            self.planner.invalidate_stats();
        }
        Ok(report)
    }

    /// Start a background retrain when the index has crossed a threshold.
    pub fn schedule_retrain(&self) -> Option<JoinHandle<Result<Option<RetrainReport>>>> {
        if !self.index.needs_retrain() {
            return None;
        }
        let index = Arc::clone(&self.index);
        Some(tokio::task::spawn_blocking(move || index.retrain()))
    }

    /// Write the current index snapshot to the database.
    pub async fn persist_index(&self) -> Result<()> {
        let snapshot = self.index.export();
        self.storage.save_index(&snapshot).await?;
        info!(
            postings = snapshot.len(),
            generation = snapshot.generation,
            "persisted vector index"
        );
        Ok(())
    }

    /// Persist the index and release the database.
    pub async fn close(self) -> Result<()> {
        self.persist_index().await?;
        info!("chunk service closed");
        Ok(())
    }

    fn after_write(&self) {
        self.planner.invalidate_stats();
        if self.config.index.auto_retrain {
            self.schedule_retrain();
        }
    }
}
