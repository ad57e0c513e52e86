//! Approximate nearest-neighbour index.
//!
//! Vectors are partitioned into clusters around k-means centroids (an
//! inverted-file layout). A query ranks the centroids and scans only the
//! `probe_count` nearest partitions.
//!
//! Concurrency:
//! - searches clone the published `Arc<Layout>` and never wait on writers
//!   beyond a per-partition read lock;
//! - inserts and removes lock one locator shard and one partition;
//! - retraining runs k-means without locks, then rebuilds under a writer gate
//!   (blocking inserts/removes only) and swaps the published layout. Searches
//!   already running finish against the old layout.

mod kmeans;
mod layout;
mod persist;

pub use persist::{PersistedIndex, Posting};

use crate::chunk::ChunkId;
use crate::config::IndexConfig;
use crate::embedding::{check_vector, dot, normalize};
use crate::error::{Error, Result};
use layout::Layout;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One search hit. Distance is cosine distance in `[0, 2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: ChunkId,
    pub distance: f32,
}

/// Hits plus how much of the index was covered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    /// Nearest first
    pub hits: Vec<SearchHit>,
    /// Partitions scanned
    pub probed: usize,
    /// Partitions in the layout that was searched
    pub partitions: usize,
    /// The deadline cut the scan short
    pub partial: bool,
}

impl SearchOutcome {
    /// Every partition was scanned, so no further hits exist.
    pub fn is_exhaustive(&self) -> bool {
        !self.partial && self.probed >= self.partitions
    }
}

/// Counters describing the current index state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub dimensions: usize,
    pub live: usize,
    pub tombstones: usize,
    pub clusters: usize,
    pub trained: bool,
    pub generation: u64,
    pub inserts_since_train: usize,
}

/// Summary of one retraining pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrainReport {
    pub generation: u64,
    pub clusters: usize,
    pub live: usize,
    pub reclaimed: usize,
    pub sample_size: usize,
    pub elapsed: Duration,
}

struct Candidate {
    distance: f32,
    id: ChunkId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

struct RetrainGuard<'a>(&'a AtomicBool);

impl<'a> RetrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RetrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Inverted-file vector index keyed by chunk id.
pub struct VectorIndex {
    dimensions: usize,
    config: IndexConfig,
    published: RwLock<Arc<Layout>>,
    rebuild_gate: RwLock<()>,
    retraining: AtomicBool,
    live: AtomicUsize,
    tombstones: AtomicUsize,
    inserts_since_train: AtomicUsize,
}

impl VectorIndex {
    /// Create an empty, untrained index.
    pub fn new(dimensions: usize, config: IndexConfig) -> Self {
        Self {
            dimensions,
            config,
            published: RwLock::new(Arc::new(Layout::new(0, Vec::new()))),
            rebuild_gate: RwLock::new(()),
            retraining: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
            inserts_since_train: AtomicUsize::new(0),
        }
    }

    /// Rebuild an index from its persisted form.
    pub fn restore(
        dimensions: usize,
        config: IndexConfig,
        persisted: PersistedIndex,
    ) -> Result<Self> {
        if persisted.dimensions != dimensions {
            return Err(Error::DimensionMismatch {
                expected: dimensions,
                actual: persisted.dimensions,
            });
        }
        for centroid in &persisted.centroids {
            check_vector(centroid, dimensions)?;
        }

        let layout = Layout::new(persisted.generation, persisted.centroids);
        let mut live = 0;
        let mut replaced = 0;
        for posting in persisted.postings {
            check_vector(&posting.vector, dimensions)?;
            let vector: Arc<[f32]> = Arc::from(normalize(&posting.vector));
            if layout.place(posting.id, vector, Some(posting.cluster)) {
                replaced += 1;
            } else {
                live += 1;
            }
        }

        info!(
            generation = layout.generation,
            clusters = layout.centroids().len(),
            live,
            "restored vector index"
        );

        let index = Self::new(dimensions, config);
        *index.published.write() = Arc::new(layout);
        index.live.store(live, AtomicOrdering::Release);
        index.tombstones.store(replaced, AtomicOrdering::Release);
        Ok(index)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn current(&self) -> Arc<Layout> {
        self.published.read().clone()
    }

    /// Live (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        self.live.load(AtomicOrdering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.current().contains(id)
    }

    /// All live ids, ascending.
    pub fn ids(&self) -> Vec<ChunkId> {
        self.current().ids()
    }

    /// Insert or replace the vector for `id`.
    pub fn insert(&self, id: ChunkId, vector: &[f32]) -> Result<()> {
        check_vector(vector, self.dimensions)?;
        let _gate = self.rebuild_gate.read();
        self.insert_unchecked(id, vector);
        Ok(())
    }

    /// Like [`insert`](Self::insert) but returns `Ok(false)` instead of
    /// waiting while a retrain is rebuilding partitions.
    pub fn try_insert(&self, id: ChunkId, vector: &[f32]) -> Result<bool> {
        check_vector(vector, self.dimensions)?;
        let Some(_gate) = self.rebuild_gate.try_read() else {
            return Ok(false);
        };
        self.insert_unchecked(id, vector);
        Ok(true)
    }

    fn insert_unchecked(&self, id: ChunkId, vector: &[f32]) {
        let layout = self.current();
        let vector: Arc<[f32]> = Arc::from(normalize(vector));
        if layout.place(id, vector, None) {
            self.tombstones.fetch_add(1, AtomicOrdering::AcqRel);
        } else {
            self.live.fetch_add(1, AtomicOrdering::AcqRel);
        }
        self.inserts_since_train.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Block writers as a retrain rebuild does.
    #[cfg(test)]
    pub(crate) fn hold_rebuild_gate(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.rebuild_gate.write()
    }

    /// Tombstone the vector for `id`. Returns false when it was not indexed.
    pub fn remove(&self, id: ChunkId) -> bool {
        let _gate = self.rebuild_gate.read();
        let removed = self.current().displace(id);
        if removed {
            self.live.fetch_sub(1, AtomicOrdering::AcqRel);
            self.tombstones.fetch_add(1, AtomicOrdering::AcqRel);
        }
        removed
    }

    /// Up to `k` nearest live vectors, probing `probe_count` clusters.
    pub fn search(&self, query: &[f32], k: usize, probe_count: usize) -> Result<Vec<SearchHit>> {
        Ok(self.search_with_deadline(query, k, probe_count, None)?.hits)
    }

    /// Search that stops probing further partitions once `deadline` passes.
    ///
    /// At least one partition is always scanned; hits gathered so far are
    /// returned with `partial` set.
    pub fn search_with_deadline(
        &self,
        query: &[f32],
        k: usize,
        probe_count: usize,
        deadline: Option<Instant>,
    ) -> Result<SearchOutcome> {
        check_vector(query, self.dimensions)?;
        let layout = self.current();
        let mut outcome = SearchOutcome {
            partitions: layout.partition_count(),
            ..SearchOutcome::default()
        };
        if k == 0 {
            return Ok(outcome);
        }

        let query = normalize(query);
        let mut heap: BinaryHeap<Candidate> =
            BinaryHeap::with_capacity(k.min(self.len()).saturating_add(1));

        for partition in layout.probe_order(&query, probe_count) {
            if outcome.probed > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                outcome.partial = true;
                break;
            }
            let partition = layout.partition(partition).read();
            for entry in partition.live() {
                let distance = (1.0 - dot(&query, &entry.vector)).clamp(0.0, 2.0);
                heap.push(Candidate {
                    distance,
                    id: entry.id,
                });
                if heap.len() > k {
                    heap.pop();
                }
            }
            outcome.probed += 1;
        }

        outcome.hits = heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| SearchHit {
                id: c.id,
                distance: c.distance,
            })
            .collect();
        Ok(outcome)
    }

    /// Whether the configured retrain thresholds have been crossed.
    pub fn needs_retrain(&self) -> bool {
        let live = self.len();
        let tombstones = self.tombstones.load(AtomicOrdering::Acquire);
        let inserts = self.inserts_since_train.load(AtomicOrdering::Acquire);

        if !self.current().is_trained() && live >= self.config.min_train_size {
            return true;
        }
        let total = live + tombstones;
        if total > 0 && tombstones as f32 / total as f32 > self.config.max_tombstone_ratio {
            return true;
        }
        inserts >= self.config.retrain_after_inserts
    }

    /// Recompute centroids from a sample of the live vectors and swap them in.
    ///
    /// Returns `None` when another retrain is already running.
    pub fn retrain(&self) -> Result<Option<RetrainReport>> {
        let Some(_guard) = RetrainGuard::acquire(&self.retraining) else {
            debug!("retrain already in progress, skipping");
            return Ok(None);
        };
        let mut rng = self.rng();
        let sample = self.sample_live(self.config.train_sample_size, &mut rng);
        Ok(Some(self.train_and_swap(&sample, &mut rng)))
    }

    /// Recompute centroids from the given vectors and swap them in.
    pub fn retrain_with<V: AsRef<[f32]>>(&self, sample: &[V]) -> Result<Option<RetrainReport>> {
        for vector in sample {
            check_vector(vector.as_ref(), self.dimensions)?;
        }
        let Some(_guard) = RetrainGuard::acquire(&self.retraining) else {
            debug!("retrain already in progress, skipping");
            return Ok(None);
        };
        let sample: Vec<Vec<f32>> = sample.iter().map(|v| normalize(v.as_ref())).collect();
        let mut rng = self.rng();
        Ok(Some(self.train_and_swap(&sample, &mut rng)))
    }

    fn rng(&self) -> StdRng {
        let generation = self.current().generation;
        StdRng::seed_from_u64(self.config.seed ^ generation.wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }

    fn target_clusters(&self, live: usize) -> usize {
        if live < self.config.min_train_size {
            return 0;
        }
        let auto = (live as f64).sqrt().round() as usize;
        self.config
            .clusters
            .unwrap_or(auto)
            .clamp(1, self.config.max_clusters)
    }

    /// Reservoir sample of live vectors from the published layout.
    fn sample_live(&self, size: usize, rng: &mut StdRng) -> Vec<Arc<[f32]>> {
        let layout = self.current();
        let mut sample: Vec<Arc<[f32]>> = Vec::with_capacity(size.min(self.len()));
        let mut seen = 0usize;
        for p in 0..layout.partition_count() {
            let partition = layout.partition(p).read();
            for entry in partition.live() {
                seen += 1;
                if sample.len() < size {
                    sample.push(Arc::clone(&entry.vector));
                } else {
                    let slot = rng.random_range(0..seen);
                    if slot < size {
                        sample[slot] = Arc::clone(&entry.vector);
                    }
                }
            }
        }
        sample
    }

    fn train_and_swap<V: AsRef<[f32]>>(&self, sample: &[V], rng: &mut StdRng) -> RetrainReport {
        let started = Instant::now();
        let clusters = self.target_clusters(self.len());
        let centroids = if clusters == 0 {
            Vec::new()
        } else {
            kmeans::train(sample, clusters, self.config.kmeans_iterations, rng)
        };
        debug!(
            clusters = centroids.len(),
            sample = sample.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "trained centroids"
        );

        let _gate = self.rebuild_gate.write();
        let old = self.current();
        let entries = old.live_entries();
        let layout = Layout::new(old.generation + 1, centroids);
        for (id, _, vector) in entries.iter() {
            layout.place(*id, Arc::clone(vector), None);
        }

        let reclaimed = self.tombstones.swap(0, AtomicOrdering::AcqRel);
        let report = RetrainReport {
            generation: layout.generation,
            clusters: layout.centroids().len(),
            live: entries.len(),
            reclaimed,
            sample_size: sample.len(),
            elapsed: started.elapsed(),
        };

        *self.published.write() = Arc::new(layout);
        self.live.store(entries.len(), AtomicOrdering::Release);
        self.inserts_since_train.store(0, AtomicOrdering::Release);

        info!(
            generation = report.generation,
            clusters = report.clusters,
            live = report.live,
            reclaimed = report.reclaimed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "vector index retrained"
        );
        report
    }

    pub fn stats(&self) -> IndexStats {
        let layout = self.current();
        IndexStats {
            dimensions: self.dimensions,
            live: self.len(),
            tombstones: self.tombstones.load(AtomicOrdering::Acquire),
            clusters: layout.centroids().len(),
            trained: layout.is_trained(),
            generation: layout.generation,
            inserts_since_train: self.inserts_since_train.load(AtomicOrdering::Acquire),
        }
    }

    /// Snapshot for persistence. Tombstoned entries are left out.
    pub fn export(&self) -> PersistedIndex {
        let layout = self.current();
        let postings = layout
            .live_entries()
            .into_iter()
            .map(|(id, cluster, vector)| Posting {
                id,
                cluster,
                vector: vector.to_vec(),
            })
            .collect();
        PersistedIndex {
            dimensions: self.dimensions,
            generation: layout.generation,
            centroids: layout.centroids().to_vec(),
            postings,
        }
    }
}
