//! Write path: validation, chunk rows and index maintenance.
//!
//! A chunk with an embedding is written to the store first and then inserted
//! into the index. If the index insert keeps failing the row is deleted again,
//! so a caller never sees a stored chunk that search cannot find. Chunks
//! without an embedding are stored as pending and stay out of the index until
//! [`IngestGateway::attach_embedding`] fills them in.
//!
//! Deletes remove the row before the index entry. A writer that indexes a
//! chunk re-reads its row afterwards and drops the entry again when a delete
//! got in between, so no index entry outlives its row.

use crate::chunk::{estimate_tokens, Chunk, ChunkId, ChunkType, ParentId};
use crate::config::IngestConfig;
use crate::embedding::{Embedder, Embedding};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::service::models::{ChunkDraft, IngestReceipt};
use crate::storage::ChunkStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct IngestGateway {
    store: Arc<dyn ChunkStore>,
    index: Arc<VectorIndex>,
    config: IngestConfig,
    embedder: Option<Arc<dyn Embedder>>,
    /// Embedded rows whose index insert failed; retried by `retry_deferred`.
    deferred: Mutex<Vec<(ChunkId, Embedding)>>,
}

struct Validated {
    chunk_type: ChunkType,
    content: String,
    embedding: Option<Embedding>,
    token_count: u32,
}

impl IngestGateway {
    pub fn new(store: Arc<dyn ChunkStore>, index: Arc<VectorIndex>, config: IngestConfig) -> Self {
        Self {
            store,
            index,
            config,
            embedder: None,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Use `embedder` for batch ingest and [`embed_pending`](Self::embed_pending).
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Store one chunk. Without an embedding it is stored as pending.
    pub async fn ingest(
        &self,
        parent_id: ParentId,
        chunk_type: &str,
        content: &str,
        embedding: Option<Embedding>,
    ) -> Result<IngestReceipt> {
        self.ingest_with_tokens(parent_id, chunk_type, content, embedding, None)
            .await
    }

    /// Like [`ingest`](Self::ingest) with a known token count.
    pub async fn ingest_with_tokens(
        &self,
        parent_id: ParentId,
        chunk_type: &str,
        content: &str,
        embedding: Option<Embedding>,
        token_count: Option<u32>,
    ) -> Result<IngestReceipt> {
        let validated = self.validate(chunk_type, content, embedding, token_count)?;
        self.write(parent_id, validated).await
    }

    /// Store several chunks of one parent.
    ///
    /// Every draft is validated before anything is written. Drafts without an
    /// embedding are embedded in one call when an embedder is configured; if
    /// that fails they are stored as pending. A failure part-way removes the
    /// chunks this call already stored.
    pub async fn ingest_batch(
        &self,
        parent_id: ParentId,
        drafts: Vec<ChunkDraft>,
    ) -> Result<Vec<IngestReceipt>> {
        let mut validated = drafts
            .into_iter()
            .map(|d| self.validate(&d.chunk_type, &d.content, d.embedding, d.token_count))
            .collect::<Result<Vec<_>>>()?;

        if let Some(embedder) = &self.embedder {
            let missing: Vec<usize> = validated
                .iter()
                .enumerate()
                .filter(|(_, v)| v.embedding.is_none())
                .map(|(i, _)| i)
                .collect();
            if !missing.is_empty() {
                let texts: Vec<String> =
                    missing.iter().map(|&i| validated[i].content.clone()).collect();
                let embedder = Arc::clone(embedder);
                let embedded = tokio::task::spawn_blocking(move || {
                    let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
                    embedder.embed_batch(&texts)
                })
                .await
                .map_err(|e| Error::Other(anyhow::Error::new(e)))?;
                match embedded {
                    Ok(embeddings) if embeddings.len() == missing.len() => {
                        for (i, embedding) in missing.into_iter().zip(embeddings) {
                            embedding.check(self.store.dimensions())?;
                            validated[i].embedding = Some(embedding);
                        }
                    }
                    Ok(embeddings) => warn!(
                        expected = missing.len(),
                        got = embeddings.len(),
                        "embedder returned a short batch, storing chunks as pending"
                    ),
                    Err(e) => {
                        warn!(error = %e, "batch embedding failed, storing chunks as pending")
                    }
                }
            }
        }

        let mut receipts = Vec::with_capacity(validated.len());
        for item in validated {
            match self.write(parent_id, item).await {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => {
                    for receipt in &receipts {
                        if let Err(undo) = self.delete(receipt.id).await {
                            error!(id = %receipt.id, error = %undo, "failed to undo batch ingest");
                        }
                    }
                    return Err(e);
                }
            }
        }
        debug!(%parent_id, count = receipts.len(), "ingested batch");
        Ok(receipts)
    }

    fn validate(
        &self,
        chunk_type: &str,
        content: &str,
        embedding: Option<Embedding>,
        token_count: Option<u32>,
    ) -> Result<Validated> {
        let chunk_type: ChunkType = chunk_type.parse()?;
        if content.trim().is_empty() {
            return Err(Error::Validation("chunk content must not be empty".to_string()));
        }
        if let Some(embedding) = &embedding {
            embedding.check(self.store.dimensions())?;
        }
        Ok(Validated {
            chunk_type,
            content: content.to_string(),
            embedding,
            token_count: token_count.unwrap_or_else(|| estimate_tokens(content)),
        })
    }

    async fn write(&self, parent_id: ParentId, item: Validated) -> Result<IngestReceipt> {
        let mut chunk = Chunk::new(parent_id, item.chunk_type, item.content)
            .with_token_count(item.token_count);
        chunk.embedding = item.embedding;
        let id = self.store.put(&chunk).await?;

        let Some(embedding) = chunk.embedding else {
            debug!(%id, "stored pending chunk");
            return Ok(IngestReceipt {
                id,
                pending_embedding: true,
            });
        };

        if let Err(e) = self.index_live(id, &embedding.vector).await {
            warn!(%id, error = %e, "index insert failed, rolling back chunk");
            if let Err(rollback) = self.store.delete(id).await {
                error!(%id, error = %rollback, "rollback failed, left for the consistency sweep");
            }
            return Err(e);
        }
        Ok(IngestReceipt {
            id,
            pending_embedding: false,
        })
    }

    /// Fill in the embedding of a pending chunk and index it.
    ///
    /// If the index insert fails the embedding stays stored and the insert is
    /// queued for [`retry_deferred`](Self::retry_deferred).
    pub async fn attach_embedding(&self, id: ChunkId, embedding: Embedding) -> Result<()> {
        self.store.attach_embedding(id, &embedding).await?;
        if let Err(e) = self.index_live(id, &embedding.vector).await {
            warn!(%id, error = %e, "deferring index insert of attached embedding");
            self.deferred.lock().push((id, embedding));
            return Err(e);
        }
        debug!(%id, "attached embedding");
        Ok(())
    }

    /// Embed up to `limit` pending chunks with the configured embedder.
    /// Returns how many became searchable.
    pub async fn embed_pending(&self, limit: usize) -> Result<usize> {
        let embedder = self
            .embedder
            .clone()
            .ok_or_else(|| Error::Config("no embedder configured".to_string()))?;
        let pending = self.store.pending(limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = pending.iter().map(|c| c.content.clone()).collect();
        let embeddings = tokio::task::spawn_blocking(move || {
            let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
            embedder.embed_batch(&texts)
        })
        .await
        .map_err(|e| Error::Other(anyhow::Error::new(e)))??;

        let mut attached = 0;
        for (chunk, embedding) in pending.iter().zip(embeddings) {
            let Some(id) = chunk.id else { continue };
            match self.attach_embedding(id, embedding).await {
                Ok(()) => attached += 1,
                // Deleted or embedded concurrently.
                Err(Error::NotFound(_)) | Err(Error::Validation(_)) => {
                    debug!(%id, "pending chunk changed while embedding")
                }
                Err(e) => return Err(e),
            }
        }
        info!(attached, requested = pending.len(), "embedded pending chunks");
        Ok(attached)
    }

    /// Retry queued index inserts. Returns how many were indexed; entries
    /// whose row has been deleted meanwhile are dropped from the queue.
    pub async fn retry_deferred(&self) -> Result<usize> {
        let queued = std::mem::take(&mut *self.deferred.lock());
        let mut done = 0;
        for (id, embedding) in queued {
            match self.store.embedding(id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(%id, "deferred chunk deleted, dropping");
                    continue;
                }
                Err(e) => {
                    warn!(%id, error = %e, "could not read deferred chunk, keeping it queued");
                    self.deferred.lock().push((id, embedding));
                    continue;
                }
            }
            match self.index_live(id, &embedding.vector).await {
                Ok(true) => done += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(%id, error = %e, "deferred index insert failed again");
                    self.deferred.lock().push((id, embedding));
                }
            }
        }
        Ok(done)
    }

    /// Number of index inserts waiting in the deferred queue.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Delete one chunk and its index entry.
    pub async fn delete(&self, id: ChunkId) -> Result<()> {
        self.store.delete(id).await?;
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.remove(id))
            .await
            .map_err(|e| Error::Other(anyhow::Error::new(e)))?;
        debug!(%id, "deleted chunk");
        Ok(())
    }

    /// Delete every chunk of a parent: rows in one transaction, then their
    /// index entries. Returns the removed ids; empty when the parent had none.
    pub async fn delete_parent(&self, parent_id: ParentId) -> Result<Vec<ChunkId>> {
        let ids = self.store.delete_by_parent(parent_id).await?;
        if ids.is_empty() {
            return Ok(ids);
        }

        let index = Arc::clone(&self.index);
        let to_remove = ids.clone();
        let removed = tokio::task::spawn_blocking(move || {
            to_remove.into_iter().filter(|id| index.remove(*id)).count()
        })
        .await
        .map_err(|e| Error::Other(anyhow::Error::new(e)))?;

        info!(%parent_id, rows = ids.len(), index_entries = removed, "deleted parent");
        Ok(ids)
    }

    /// Index a stored chunk. Returns `false` when the row was deleted while
    /// the insert ran; the entry is removed again in that case.
    async fn index_live(&self, id: ChunkId, vector: &[f32]) -> Result<bool> {
        self.index_with_retry(id, vector).await?;
        if self.store.embedding(id).await?.is_some() {
            return Ok(true);
        }
        self.index.remove(id);
        debug!(%id, "chunk deleted while indexing, dropped index entry");
        Ok(false)
    }

    /// Insert into the index, backing off while a retrain rebuild holds the
    /// writer gate or a transient error occurs.
    async fn index_with_retry(&self, id: ChunkId, vector: &[f32]) -> Result<()> {
        let mut backoff = self.config.retry_backoff();
        for attempt in 0..=self.config.index_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            match self.index.try_insert(id, vector) {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(%id, attempt, "index rebuilding, backing off"),
                Err(e) if e.is_retryable() => {
                    warn!(%id, attempt, error = %e, "index insert failed, retrying")
                }
                Err(e) => return Err(e),
            }
        }

        // Still rebuilding: wait for the gate off the async runtime.
        let index = Arc::clone(&self.index);
        let vector = vector.to_vec();
        tokio::task::spawn_blocking(move || index.insert(id, &vector))
            .await
            .map_err(|e| Error::Other(anyhow::Error::new(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::testutils::{test_storage, HashEmbedder, InterleavingStore, TestFixtures};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn axis(dims: usize, axis: usize) -> Embedding {
        TestFixtures::axis(dims, axis)
    }

    fn gateway(dims: usize) -> (IngestGateway, Arc<dyn ChunkStore>, Arc<VectorIndex>) {
        let store: Arc<dyn ChunkStore> = Arc::new(test_storage(dims));
        let index = Arc::new(VectorIndex::new(dims, IndexConfig::default()));
        let gateway = IngestGateway::new(Arc::clone(&store), Arc::clone(&index), fast_retries());
        (gateway, store, index)
    }

    fn fast_retries() -> IngestConfig {
        IngestConfig {
            index_retries: 2,
            retry_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_ingest_with_embedding_is_indexed() {
        let (gateway, store, index) = gateway(4);
        let receipt = gateway
            .ingest(ParentId(1), "definition", "A set is a collection", Some(axis(4, 0)))
            .await
            .unwrap();

        assert!(!receipt.pending_embedding);
        assert!(index.contains(receipt.id));
        let chunk = store.get(receipt.id).await.unwrap();
        assert_eq!(chunk.token_count, 5);
        assert_eq!(chunk.chunk_type, ChunkType::Definition);
    }

    #[tokio::test]
    async fn test_invalid_type_leaves_no_row() {
        let (gateway, store, _) = gateway(4);
        let err = gateway
            .ingest(ParentId(1), "invalid", "text", Some(axis(4, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(matches!(
            gateway.ingest(ParentId(1), "example", "   ", None).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wrong_dimensions_rejected_before_write() {
        let (gateway, store, _) = gateway(4);
        assert!(matches!(
            gateway
                .ingest(ParentId(1), "example", "text", Some(Embedding::new(vec![1.0; 3])))
                .await,
            Err(Error::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_index_failure_rolls_back_row() {
        let store: Arc<dyn ChunkStore> = Arc::new(test_storage(4));
        // Index disagrees with the store, so every insert fails.
        let index = Arc::new(VectorIndex::new(3, IndexConfig::default()));
        let gateway = IngestGateway::new(Arc::clone(&store), index, IngestConfig::default());

        let result = gateway
            .ingest(ParentId(1), "example", "e.g. this", Some(axis(4, 1)))
            .await;
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_then_attach() {
        let (gateway, store, index) = gateway(4);
        let receipt = gateway
            .ingest(ParentId(1), "procedure", "Step one", None)
            .await
            .unwrap();
        assert!(receipt.pending_embedding);
        assert!(!index.contains(receipt.id));

        gateway
            .attach_embedding(receipt.id, axis(4, 2))
            .await
            .unwrap();
        assert!(index.contains(receipt.id));
        assert!(store.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_pending_requires_embedder() {
        let (gateway, _, _) = gateway(4);
        assert!(matches!(gateway.embed_pending(10).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_embed_pending_drains_queue() {
        let (gateway, store, index) = gateway(8);
        let gateway = gateway.with_embedder(Arc::new(HashEmbedder::new(8)));
        for i in 0..3 {
            gateway
                .ingest(ParentId(1), "concept", &format!("idea {}", i), None)
                .await
                .unwrap();
        }
        assert_eq!(gateway.embed_pending(2).await.unwrap(), 2);
        assert_eq!(store.pending(10).await.unwrap().len(), 1);
        assert_eq!(gateway.embed_pending(10).await.unwrap(), 1);
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_embeds_missing_vectors() {
        let (gateway, _, index) = gateway(8);
        let embedder = Arc::new(HashEmbedder::new(8));
        let gateway = gateway.with_embedder(embedder.clone());

        let receipts = gateway
            .ingest_batch(
                ParentId(7),
                vec![
                    ChunkDraft::new("definition", "A group is a set"),
                    ChunkDraft::new("example", "The integers").with_embedding(axis(8, 3)),
                    ChunkDraft::new("application", "Symmetry in crystals"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(receipts.len(), 3);
        assert!(receipts.iter().all(|r| !r.pending_embedding));
        assert_eq!(index.len(), 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_embedding_failure_stores_pending() {
        let (gateway, store, index) = gateway(8);
        let gateway = gateway.with_embedder(Arc::new(HashEmbedder::new(8)));

        let receipts = gateway
            .ingest_batch(
                ParentId(3),
                vec![
                    ChunkDraft::new("definition", "fail-embed this one"),
                    ChunkDraft::new("example", "given").with_embedding(axis(8, 1)),
                    ChunkDraft::new("concept", "plain text"),
                ],
            )
            .await
            .unwrap();

        let pending: Vec<bool> = receipts.iter().map(|r| r.pending_embedding).collect();
        assert_eq!(pending, vec![true, false, true]);
        assert_eq!(index.len(), 1);
        assert_eq!(store.pending(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_attach_is_deferred_until_retried() {
        let store: Arc<dyn ChunkStore> = Arc::new(test_storage(4));
        let index = Arc::new(VectorIndex::new(3, IndexConfig::default()));
        let gateway = IngestGateway::new(Arc::clone(&store), Arc::clone(&index), fast_retries());

        let kept = gateway.ingest(ParentId(1), "example", "kept", None).await.unwrap();
        let gone = gateway.ingest(ParentId(1), "example", "gone", None).await.unwrap();
        for id in [kept.id, gone.id] {
            assert!(matches!(
                gateway.attach_embedding(id, axis(4, 0)).await,
                Err(Error::DimensionMismatch { expected: 3, actual: 4 })
            ));
        }
        // The embedding is stored even though the index refused it.
        assert!(store.embedding(kept.id).await.unwrap().is_some());
        assert_eq!(gateway.deferred_len(), 2);

        store.delete(gone.id).await.unwrap();
        assert_eq!(gateway.retry_deferred().await.unwrap(), 0);
        assert_eq!(gateway.deferred_len(), 1);
    }

    #[tokio::test]
    async fn test_retry_deferred_indexes_queued_rows() {
        let (gateway, store, index) = gateway(4);
        let id = store
            .put(&TestFixtures::chunk(1, ChunkType::Concept, "late").with_embedding(axis(4, 2)))
            .await
            .unwrap();
        gateway.deferred.lock().push((id, axis(4, 2)));

        assert_eq!(gateway.retry_deferred().await.unwrap(), 1);
        assert_eq!(gateway.deferred_len(), 0);
        assert!(index.contains(id));
    }

    #[tokio::test]
    async fn test_insert_waits_out_rebuild() {
        let (gateway, store, index) = gateway(4);
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                let _gate = index.hold_rebuild_gate();
                held_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
            })
        };
        held_rx.recv().unwrap();

        let receipt = gateway
            .ingest(ParentId(1), "definition", "during rebuild", Some(axis(4, 1)))
            .await
            .unwrap();
        holder.join().unwrap();

        assert!(index.contains(receipt.id));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_during_ingest_leaves_no_index_entry() {
        let store = Arc::new(InterleavingStore::new(4));
        let index = Arc::new(VectorIndex::new(4, IndexConfig::default()));
        let gateway = IngestGateway::new(store.clone(), Arc::clone(&index), fast_retries());

        store.delete_after_put.store(true, Ordering::SeqCst);
        let receipt = gateway
            .ingest(ParentId(1), "example", "short-lived", Some(axis(4, 0)))
            .await
            .unwrap();
        assert!(!index.contains(receipt.id));
        assert!(index.is_empty());
        store.delete_after_put.store(false, Ordering::SeqCst);

        let pending = gateway.ingest(ParentId(1), "example", "later", None).await.unwrap();
        store.delete_after_attach.store(true, Ordering::SeqCst);
        gateway.attach_embedding(pending.id, axis(4, 1)).await.unwrap();
        assert!(!index.contains(pending.id));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_validation_is_all_or_nothing() {
        let (gateway, store, _) = gateway(4);
        let result = gateway
            .ingest_batch(
                ParentId(7),
                vec![ChunkDraft::new("definition", "ok"), ChunkDraft::new("bogus", "bad")],
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_parent_cascades_to_index() {
        let (gateway, store, index) = gateway(4);
        let mut ids = Vec::new();
        for n in 0..3 {
            let receipt = gateway
                .ingest(ParentId(9), "example", "x", Some(axis(4, n)))
                .await
                .unwrap();
            ids.push(receipt.id);
        }
        let other = gateway
            .ingest(ParentId(10), "example", "y", Some(axis(4, 3)))
            .await
            .unwrap();

        let removed = gateway.delete_parent(ParentId(9)).await.unwrap();
        assert_eq!(removed, ids);
        assert!(store.list_by_parent(ParentId(9)).await.unwrap().is_empty());
        assert!(ids.iter().all(|id| !index.contains(*id)));
        assert!(index.contains(other.id));

        assert!(gateway.delete_parent(ParentId(9)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_chunk() {
        let (gateway, _, _) = gateway(4);
        assert!(matches!(gateway.delete(ChunkId(1)).await, Err(Error::NotFound(_))));
    }
}
