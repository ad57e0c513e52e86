//! Chunk-type balance of a set of subtopics.

use crate::chunk::ChunkType;
use serde::Serialize;
use std::collections::BTreeMap;

/// Share of each chunk type in a well-rounded subtopic.
pub fn ideal_share(chunk_type: ChunkType) -> f32 {
    match chunk_type {
        ChunkType::Definition => 0.30,
        ChunkType::Example => 0.25,
        ChunkType::Application => 0.25,
        ChunkType::Procedure => 0.15,
        ChunkType::Concept => 0.05,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub total_chunks: usize,
    /// Every type is present, zero when absent
    pub by_type: BTreeMap<ChunkType, usize>,
    /// 1.0 for the ideal mix, 0.0 for an empty set
    pub balance_score: f32,
}

impl CoverageReport {
    pub fn from_counts(counts: BTreeMap<ChunkType, usize>) -> Self {
        let by_type: BTreeMap<ChunkType, usize> = ChunkType::ALL
            .iter()
            .map(|t| (*t, counts.get(t).copied().unwrap_or(0)))
            .collect();
        let total_chunks: usize = by_type.values().sum();

        let balance_score = if total_chunks == 0 {
            0.0
        } else {
            let sum: f32 = by_type
                .iter()
                .map(|(t, n)| {
                    let actual = *n as f32 / total_chunks as f32;
                    (1.0 - (actual - ideal_share(*t)).abs()).max(0.0)
                })
                .sum();
            sum / ChunkType::ALL.len() as f32
        };

        Self {
            total_chunks,
            by_type,
            balance_score,
        }
    }

    /// Types below their ideal share, most lacking first.
    pub fn underrepresented(&self) -> Vec<ChunkType> {
        let mut gaps: Vec<(ChunkType, f32)> = self
            .by_type
            .iter()
            .map(|(t, n)| {
                let actual = if self.total_chunks == 0 {
                    0.0
                } else {
                    *n as f32 / self.total_chunks as f32
                };
                (*t, ideal_share(*t) - actual)
            })
            .filter(|(_, gap)| *gap > 0.0)
            .collect();
        gaps.sort_by(|a, b| b.1.total_cmp(&a.1));
        gaps.into_iter().map(|(t, _)| t).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ideal_mix_scores_one() {
        let counts = BTreeMap::from([
            (ChunkType::Definition, 30),
            (ChunkType::Example, 25),
            (ChunkType::Application, 25),
            (ChunkType::Procedure, 15),
            (ChunkType::Concept, 5),
        ]);
        let report = CoverageReport::from_counts(counts);
        assert_eq!(report.total_chunks, 100);
        assert!((report.balance_score - 1.0).abs() < 1e-5);
        assert!(report.underrepresented().is_empty());
    }

    #[test]
    fn test_single_type_is_penalised() {
        let report = CoverageReport::from_counts(BTreeMap::from([(ChunkType::Definition, 10)]));
        assert!((report.balance_score - 0.72).abs() < 1e-5);
        assert_eq!(report.by_type[&ChunkType::Concept], 0);
        assert_eq!(report.underrepresented()[0], ChunkType::Example);
    }

    #[test]
    fn test_empty_scores_zero() {
        let report = CoverageReport::from_counts(BTreeMap::new());
        assert_eq!(report.total_chunks, 0);
        assert_eq!(report.balance_score, 0.0);
    }
}
