//! Embedding vectors and cosine math.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// An embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// The vector data
    pub vector: Vec<f32>,
}

impl Embedding {
    /// Create a new embedding.
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }

    /// Number of components.
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// Reject vectors of the wrong length or with non-finite components.
    pub fn check(&self, expected: usize) -> Result<()> {
        check_vector(&self.vector, expected)
    }

    /// Compute cosine similarity with another embedding.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }

    /// Cosine distance (`1 - similarity`).
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.cosine_similarity(other)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(vector: Vec<f32>) -> Self {
        Self::new(vector)
    }
}

pub(crate) fn check_vector(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
        return Err(Error::Validation(format!(
            "embedding component {} is not finite",
            pos
        )));
    }
    Ok(())
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scale to unit length. Zero vectors stay zero.
pub(crate) fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = dot(vector, vector).sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

/// Trait for generating text embeddings.
///
/// The model lives outside this crate; the gateway only needs something that
/// turns text into vectors of the configured dimensionality.
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text.
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generate embeddings for multiple texts.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}
