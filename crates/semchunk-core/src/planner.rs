//! Filtered similarity queries.
//!
//! A query either scores the filtered rows exactly or searches the vector
//! index and filters afterwards. The choice is made from cached cardinality
//! statistics: when the filter is expected to match at most
//! `exact_scan_factor * k` chunks, exact scoring is cheaper than probing.

use crate::chunk::ChunkId;
use crate::config::PlannerConfig;
use crate::embedding::{dot, normalize, Embedding};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::query::{ChunkFilter, ChunkQuery};
use crate::service::models::{QueryResult, QueryStrategy, ScoredChunk};
use crate::storage::{CardinalityStats, ChunkStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

struct CachedStats {
    stats: Arc<CardinalityStats>,
    loaded_at: Instant,
}

/// Chooses between exact scan and index probe per query.
pub struct QueryPlanner {
    store: Arc<dyn ChunkStore>,
    index: Arc<VectorIndex>,
    config: PlannerConfig,
    stats: RwLock<Option<CachedStats>>,
}

impl QueryPlanner {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        index: Arc<VectorIndex>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            store,
            index,
            config,
            stats: RwLock::new(None),
        }
    }

    /// Up to `k` embedded chunks matching `filter`, nearest first.
    pub async fn query(
        &self,
        filter: &ChunkFilter,
        embedding: &Embedding,
        k: usize,
    ) -> Result<QueryResult> {
        self.query_with_probes(filter, embedding, k, None).await
    }

    /// Run a parsed [`ChunkQuery`].
    pub async fn run(&self, query: &ChunkQuery, embedding: &Embedding) -> Result<QueryResult> {
        self.query_with_probes(&query.filter, embedding, query.limit, query.probe_count)
            .await
    }

    /// Like [`query`](Self::query) with an explicit probe count for the index path.
    pub async fn query_with_probes(
        &self,
        filter: &ChunkFilter,
        embedding: &Embedding,
        k: usize,
        probe_count: Option<usize>,
    ) -> Result<QueryResult> {
        embedding.check(self.index.dimensions())?;
        if k == 0 {
            return Ok(QueryResult {
                hits: Vec::new(),
                requested: 0,
                strategy: QueryStrategy::ExactScan { candidates: 0 },
                partial: false,
            });
        }

        let stats = self.stats().await?;
        let estimate = stats.estimate(filter);
        let threshold = self.config.exact_scan_factor.saturating_mul(k);
        debug!(?filter, k, estimate, threshold, "planning query");

        if estimate <= threshold {
            self.exact_scan(filter, embedding, k).await
        } else {
            let probes = probe_count.unwrap_or(self.config.probe_count).max(1);
            self.index_probe(filter, embedding, k, probes).await
        }
    }

    async fn exact_scan(
        &self,
        filter: &ChunkFilter,
        embedding: &Embedding,
        k: usize,
    ) -> Result<QueryResult> {
        let query = normalize(&embedding.vector);
        let candidates = self.store.find(filter).await?;
        let total = candidates.len();

        let mut scored: Vec<ScoredChunk> = candidates
            .into_iter()
            .filter_map(|chunk| {
                let vector = normalize(&chunk.embedding.as_ref()?.vector);
                let distance = (1.0 - dot(&query, &vector)).clamp(0.0, 2.0);
                Some(ScoredChunk::new(chunk, distance))
            })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);

        debug!(candidates = total, returned = scored.len(), "exact scan");
        Ok(QueryResult {
            hits: scored,
            requested: k,
            strategy: QueryStrategy::ExactScan { candidates: total },
            partial: false,
        })
    }

    async fn index_probe(
        &self,
        filter: &ChunkFilter,
        embedding: &Embedding,
        k: usize,
        probes: usize,
    ) -> Result<QueryResult> {
        let deadline = Instant::now() + self.config.search_timeout();
        let mut fetch = k.saturating_mul(self.config.oversample_factor).max(k);
        let mut probes = probes;
        let mut attempts = 0;
        let mut partial = false;

        let hits = loop {
            attempts += 1;
            let outcome = self
                .index
                .search_with_deadline(&embedding.vector, fetch, probes, Some(deadline))?;
            partial |= outcome.partial;

            let ids: Vec<ChunkId> = outcome.hits.iter().map(|hit| hit.id).collect();
            let mut rows: HashMap<ChunkId, _> = self
                .store
                .get_many(&ids)
                .await?
                .into_iter()
                .filter_map(|chunk| chunk.id.map(|id| (id, chunk)))
                .collect();

            let mut survivors = Vec::with_capacity(k.min(outcome.hits.len()));
            for hit in &outcome.hits {
                // Stale index entries have no row, or a row without embedding.
                let Some(chunk) = rows.remove(&hit.id) else {
                    continue;
                };
                if chunk.is_pending() || !filter.matches(&chunk) {
                    continue;
                }
                survivors.push(ScoredChunk::new(chunk, hit.distance));
                if survivors.len() == k {
                    break;
                }
            }

            let exhausted = outcome.is_exhaustive() && outcome.hits.len() < fetch;
            debug!(
                attempt = attempts,
                fetch,
                probes,
                returned = outcome.hits.len(),
                survivors = survivors.len(),
                "index probe"
            );
            let out_of_retries = attempts > self.config.max_retries;
            if survivors.len() >= k || exhausted || outcome.partial || out_of_retries {
                break survivors;
            }
            fetch = fetch.saturating_mul(2);
            probes = probes.saturating_mul(2);
        };

        Ok(QueryResult {
            hits,
            requested: k,
            strategy: QueryStrategy::IndexProbe {
                attempts,
                fetched: fetch,
            },
            partial,
        })
    }

    async fn stats(&self) -> Result<Arc<CardinalityStats>> {
        let ttl = self.config.stats_ttl();
        let cached = {
            let guard = self.stats.read();
            guard
                .as_ref()
                .filter(|cached| cached.loaded_at.elapsed() < ttl)
                .map(|cached| Arc::clone(&cached.stats))
        };
        match cached {
            Some(stats) => Ok(stats),
            None => self.refresh_stats().await,
        }
    }

    /// Reload cardinality statistics from the store.
    pub async fn refresh_stats(&self) -> Result<Arc<CardinalityStats>> {
        let stats = Arc::new(self.store.stats().await?);
        *self.stats.write() = Some(CachedStats {
            stats: Arc::clone(&stats),
            loaded_at: Instant::now(),
        });
        Ok(stats)
    }

    /// Drop cached statistics so the next query reloads them.
    pub fn invalidate_stats(&self) {
        *self.stats.write() = None;
    }
}
