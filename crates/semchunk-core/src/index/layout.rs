//! One published generation of the inverted-file index.

use super::kmeans;
use crate::chunk::ChunkId;
use crate::embedding::dot;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

const LOCATOR_SHARDS: usize = 16;

pub(crate) struct Entry {
    pub id: ChunkId,
    pub vector: Arc<[f32]>,
    pub removed: bool,
}

/// Vectors assigned to one centroid. Removal only flips a tombstone flag.
#[derive(Default)]
pub(crate) struct Partition {
    entries: Vec<Entry>,
    tombstones: usize,
}

impl Partition {
    fn push(&mut self, id: ChunkId, vector: Arc<[f32]>) {
        self.entries.push(Entry {
            id,
            vector,
            removed: false,
        });
    }

    fn tombstone(&mut self, id: ChunkId) -> bool {
        match self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.id == id && !e.removed)
        {
            Some(entry) => {
                entry.removed = true;
                self.tombstones += 1;
                true
            }
            None => false,
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| !e.removed)
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }
}

/// Centroids plus the partitions hanging off them.
///
/// Centroids never change once a layout is built; retraining builds a new
/// layout. An untrained layout has no centroids and a single partition.
pub(crate) struct Layout {
    pub generation: u64,
    centroids: Vec<Vec<f32>>,
    partitions: Vec<RwLock<Partition>>,
    locator: Vec<Mutex<HashMap<ChunkId, usize>>>,
}

impl Layout {
    pub fn new(generation: u64, centroids: Vec<Vec<f32>>) -> Self {
        let partitions = (0..centroids.len().max(1))
            .map(|_| RwLock::new(Partition::default()))
            .collect();
        let locator = (0..LOCATOR_SHARDS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            generation,
            centroids,
            partitions,
            locator,
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, index: usize) -> &RwLock<Partition> {
        &self.partitions[index]
    }

    /// Partition a (normalised) vector belongs to.
    pub fn assign(&self, vector: &[f32]) -> usize {
        if self.is_trained() {
            kmeans::nearest(&self.centroids, vector).0
        } else {
            0
        }
    }

    /// The `n` partitions whose centroids are closest to `query`, nearest first.
    pub fn probe_order(&self, query: &[f32], n: usize) -> Vec<usize> {
        if !self.is_trained() {
            return vec![0];
        }
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(c, query)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().take(n.max(1)).map(|(i, _)| i).collect()
    }

    fn shard(&self, id: ChunkId) -> &Mutex<HashMap<ChunkId, usize>> {
        &self.locator[id.0.rem_euclid(LOCATOR_SHARDS as i64) as usize]
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.shard(id).lock().contains_key(&id)
    }

    /// Insert or replace `id`. Returns true when an older entry was tombstoned.
    ///
    /// The shard lock is held for the whole upsert so operations on one id
    /// are serialised; partition locks are always taken after it.
    pub fn place(&self, id: ChunkId, vector: Arc<[f32]>, partition: Option<usize>) -> bool {
        let mut shard = self.shard(id).lock();
        let replaced = match shard.get(&id) {
            Some(&old) => self.partitions[old].write().tombstone(id),
            None => false,
        };
        let target = match partition {
            Some(p) if p < self.partitions.len() => p,
            _ => self.assign(&vector),
        };
        self.partitions[target].write().push(id, vector);
        shard.insert(id, target);
        replaced
    }

    /// Tombstone `id`. Returns false when it was not indexed.
    pub fn displace(&self, id: ChunkId) -> bool {
        let mut shard = self.shard(id).lock();
        match shard.remove(&id) {
            Some(p) => self.partitions[p].write().tombstone(id),
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self
            .locator
            .iter()
            .flat_map(|shard| shard.lock().keys().copied().collect::<Vec<_>>())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every live entry with the partition it sits in.
    pub fn live_entries(&self) -> Vec<(ChunkId, usize, Arc<[f32]>)> {
        let mut out = Vec::new();
        for (p, partition) in self.partitions.iter().enumerate() {
            let partition = partition.read();
            out.extend(partition.live().map(|e| (e.id, p, Arc::clone(&e.vector))));
        }
        out
    }
}
