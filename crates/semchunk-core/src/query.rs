//! Query filters and the filter DSL.

use crate::chunk::{Chunk, ChunkType, ParentId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Attribute filters applied to a similarity query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFilter {
    /// Only chunks of these subtopics, sorted and deduplicated. An empty set
    /// matches nothing; `None` matches every parent.
    pub parent_ids: Option<Vec<ParentId>>,
    /// Only chunks of this kind
    pub chunk_type: Option<ChunkType>,
}

impl ChunkFilter {
    /// Filter on a parent.
    pub fn parent(parent_id: ParentId) -> Self {
        Self::parents([parent_id])
    }

    /// Filter on a set of parents, e.g. the earlier subtopics of a topic.
    pub fn parents(parent_ids: impl IntoIterator<Item = ParentId>) -> Self {
        let mut ids: Vec<ParentId> = parent_ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self {
            parent_ids: Some(ids),
            chunk_type: None,
        }
    }

    /// Add a chunk type constraint.
    pub fn with_type(mut self, chunk_type: ChunkType) -> Self {
        self.chunk_type = Some(chunk_type);
        self
    }

    /// True when no attribute is constrained.
    pub fn is_empty(&self) -> bool {
        self.parent_ids.is_none() && self.chunk_type.is_none()
    }

    /// True when the filter can never match, i.e. an empty parent set.
    pub fn is_unsatisfiable(&self) -> bool {
        self.parent_ids.as_ref().is_some_and(|ids| ids.is_empty())
    }

    /// Check a chunk against the filter.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.parent_ids
            .as_ref()
            .map_or(true, |ids| ids.binary_search(&chunk.parent_id).is_ok())
            && self.chunk_type.map_or(true, |t| chunk.chunk_type == t)
    }
}

/// A parsed query: filters, result count, optional probe override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkQuery {
    /// Attribute filters
    pub filter: ChunkFilter,
    /// Maximum number of results
    pub limit: usize,
    /// Clusters to probe; planner default when `None`
    pub probe_count: Option<usize>,
}

impl Default for ChunkQuery {
    fn default() -> Self {
        Self {
            filter: ChunkFilter::default(),
            limit: 10,
            probe_count: None,
        }
    }
}

impl ChunkQuery {
    /// Parse a filter expression.
    ///
    /// Example: "parent:12 type:definition limit:5 probes:4". Several parents
    /// are given as `parent:3,4,5`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut query = ChunkQuery::default();

        for token in input.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| Error::Validation(format!("expected key:value, got {:?}", token)))?;

            match key.to_lowercase().as_str() {
                "parent" | "parent_id" | "subtopic" => {
                    let mut ids = query.filter.parent_ids.take().unwrap_or_default();
                    for part in value.split(',') {
                        let id = part.parse::<i64>().map_err(|_| {
                            Error::Validation(format!("invalid parent id: {:?}", part))
                        })?;
                        ids.push(ParentId(id));
                    }
                    query.filter.parent_ids = ChunkFilter::parents(ids).parent_ids;
                }
                "type" | "chunk_type" => query.filter.chunk_type = Some(value.parse()?),
                "limit" | "k" => {
                    query.limit = value
                        .parse::<usize>()
                        .map_err(|_| Error::Validation(format!("invalid limit: {:?}", value)))?;
                }
                "probes" | "probe" => {
                    let probes = value.parse::<usize>().map_err(|_| {
                        Error::Validation(format!("invalid probe count: {:?}", value))
                    })?;
                    query.probe_count = Some(probes.max(1));
                }
                other => {
                    return Err(Error::Validation(format!("unknown filter key: {:?}", other)));
                }
            }
        }

        Ok(query)
    }
}
