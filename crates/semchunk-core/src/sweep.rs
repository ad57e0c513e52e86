//! Reconciliation of the vector index against chunk rows.
//!
//! Deletes remove rows before index entries, and ingest writes rows before
//! index entries, so a crash between the two phases leaves either an orphaned
//! index entry or an embedded row missing from the index. Both are repaired
//! here.
//!
//! Writers keep running during a sweep, so the id snapshot can be stale by
//! the time an entry is looked at. Every repair re-reads the row first.

use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::storage::ChunkStore;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

/// Repairs made by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Index entries without an embedded row
    pub orphans_removed: usize,
    /// Embedded rows that were missing from the index
    pub missing_restored: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_removed == 0 && self.missing_restored == 0
    }
}

/// Make the index hold exactly the embedded rows of `store`.
pub async fn reconcile(store: &dyn ChunkStore, index: &VectorIndex) -> Result<SweepReport> {
    let embedded: HashSet<_> = store.embedded_ids().await?.into_iter().collect();
    let mut report = SweepReport::default();

    for id in index.ids() {
        if embedded.contains(&id) {
            continue;
        }
        // Ingested since the snapshot.
        if store.embedding(id).await?.is_some() {
            continue;
        }
        if index.remove(id) {
            let issue =
                Error::IndexInconsistency(format!("index entry {} has no embedded row", id));
            warn!(%id, error = %issue, "removed orphaned index entry");
            report.orphans_removed += 1;
        }
    }

    let mut missing: Vec<_> = embedded.into_iter().filter(|id| !index.contains(*id)).collect();
    missing.sort_unstable();
    for id in missing {
        // Deleted since the id scan.
        let Some(embedding) = store.embedding(id).await? else {
            continue;
        };
        index.insert(id, &embedding.vector)?;
        // A delete that ran between the read and the insert already tried to
        // remove the entry.
        if store.embedding(id).await?.is_none() {
            index.remove(id);
            continue;
        }
        warn!(%id, "restored missing index entry");
        report.missing_restored += 1;
    }

    if report.is_clean() {
        info!(indexed = index.len(), "consistency sweep found nothing to repair");
    } else {
        info!(
            orphans_removed = report.orphans_removed,
            missing_restored = report.missing_restored,
            "consistency sweep repaired index"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkId, ChunkType};
    use crate::config::IndexConfig;
    use crate::testutils::{init_tracing, test_storage, InterleavingStore, TestFixtures};
    use std::sync::Arc;

    fn axis(axis: usize) -> crate::Embedding {
        TestFixtures::axis(4, axis)
    }

    #[tokio::test]
    async fn test_sweep_repairs_both_directions() {
        init_tracing();
        let store = test_storage(4);
        let index = VectorIndex::new(4, IndexConfig::default());

        let indexed = store
            .put(&TestFixtures::chunk(1, ChunkType::Definition, "kept").with_embedding(axis(0)))
            .await
            .unwrap();
        index.insert(indexed, &TestFixtures::axis(4, 0).vector).unwrap();

        let unindexed = store
            .put(&TestFixtures::chunk(1, ChunkType::Example, "lost").with_embedding(axis(1)))
            .await
            .unwrap();
        let pending = store
            .put(&TestFixtures::chunk(1, ChunkType::Example, "pending"))
            .await
            .unwrap();
        index.insert(ChunkId(999), &TestFixtures::axis(4, 2).vector).unwrap();

        let report = reconcile(&store, &index).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                orphans_removed: 1,
                missing_restored: 1
            }
        );
        assert_eq!(index.ids(), vec![indexed, unindexed]);
        assert!(!index.contains(pending));

        assert!(reconcile(&store, &index).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_sweep_keeps_chunk_ingested_after_snapshot() {
        init_tracing();
        let store = InterleavingStore::new(4);
        let index = Arc::new(VectorIndex::new(4, IndexConfig::default()));
        store.ingest_after_snapshot(
            TestFixtures::chunk(2, ChunkType::Concept, "fresh").with_embedding(axis(3)),
            Arc::clone(&index),
        );

        let report = reconcile(&store, &index).await.unwrap();
        let fresh = store.written.lock()[0];
        assert!(report.is_clean());
        assert!(index.contains(fresh));
        assert!(store.embedding(fresh).await.unwrap().is_some());
        assert!(reconcile(&store, &index).await.unwrap().is_clean());
    }
}
