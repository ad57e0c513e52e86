//! Spherical k-means over unit vectors.
//!
//! Centroids are kept at unit length so "nearest" is simply the largest dot
//! product. Inputs are expected to be normalised already.

use crate::embedding::{dot, normalize};
use rand::rngs::StdRng;
use rand::Rng;

/// Index of the centroid with the largest dot product, and that product.
///
/// Ties resolve to the lowest index. Returns `(0, 0.0)` for no centroids.
pub(crate) fn nearest(centroids: &[Vec<f32>], vector: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, centroid) in centroids.iter().enumerate() {
        let score = dot(centroid, vector);
        if score > best.1 {
            best = (i, score);
        }
    }
    if centroids.is_empty() {
        (0, 0.0)
    } else {
        best
    }
}

fn distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - dot(a, b)).max(0.0)
}

/// Train `k` centroids on `sample`.
///
/// `k` is clamped to the sample size. Stops early once no point changes
/// cluster between two passes.
pub(crate) fn train<V: AsRef<[f32]>>(
    sample: &[V],
    k: usize,
    iterations: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    if sample.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(sample.len());
    let dims = sample[0].as_ref().len();

    let mut centroids = seed_plus_plus(sample, k, rng);
    let mut assignment = vec![usize::MAX; sample.len()];

    for iteration in 0..iterations {
        let mut changed = 0usize;
        for (i, vector) in sample.iter().enumerate() {
            let (best, _) = nearest(&centroids, vector.as_ref());
            if assignment[i] != best {
                assignment[i] = best;
                changed += 1;
            }
        }
        if changed == 0 {
            tracing::debug!(iteration, "k-means converged");
            break;
        }

        let mut sums = vec![vec![0.0f32; dims]; k];
        let mut counts = vec![0usize; k];
        for (vector, &cluster) in sample.iter().zip(assignment.iter()) {
            counts[cluster] += 1;
            for (sum, x) in sums[cluster].iter_mut().zip(vector.as_ref()) {
                *sum += x;
            }
        }

        for cluster in 0..k {
            if counts[cluster] == 0 {
                // Empty cluster: move it onto the point that fits its own centroid worst.
                let worst = worst_fit(sample, &centroids, &assignment);
                centroids[cluster] = normalize(sample[worst].as_ref());
                assignment[worst] = cluster;
            } else {
                centroids[cluster] = normalize(&sums[cluster]);
            }
        }
    }

    centroids
}

/// k-means++ seeding: each next seed is drawn with probability proportional
/// to its squared distance from the closest seed chosen so far.
fn seed_plus_plus<V: AsRef<[f32]>>(sample: &[V], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = sample.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(normalize(sample[rng.random_range(0..n)].as_ref()));

    let mut weights: Vec<f32> = sample
        .iter()
        .map(|v| distance(v.as_ref(), &centroids[0]).powi(2))
        .collect();

    while centroids.len() < k {
        let total: f32 = weights.iter().sum();
        let next = if total <= f32::EPSILON {
            rng.random_range(0..n)
        } else {
            let mut target = rng.random::<f32>() * total;
            let mut chosen = n - 1;
            for (i, w) in weights.iter().enumerate() {
                if target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        };

        let centroid = normalize(sample[next].as_ref());
        for (w, v) in weights.iter_mut().zip(sample.iter()) {
            let d = distance(v.as_ref(), &centroid).powi(2);
            if d < *w {
                *w = d;
            }
        }
        centroids.push(centroid);
    }

    centroids
}

fn worst_fit<V: AsRef<[f32]>>(sample: &[V], centroids: &[Vec<f32>], assignment: &[usize]) -> usize {
    let mut worst = (0, f32::NEG_INFINITY);
    for (i, (vector, &cluster)) in sample.iter().zip(assignment.iter()).enumerate() {
        let d = distance(vector.as_ref(), &centroids[cluster]);
        if d > worst.1 {
            worst = (i, d);
        }
    }
    worst.0
}
