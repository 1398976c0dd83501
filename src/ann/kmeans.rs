//! Seeded Lloyd's k-means over flat row-major vectors.

use rand::{Rng, SeedableRng, rngs::StdRng, seq::index::sample};
use rayon::prelude::*;

use super::squared_l2;

/// Cluster centroids learned from training data, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroids {
    dimension: usize,
    data: Vec<f32>,
}

impl Centroids {
    pub fn from_vec(dimension: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len() % dimension, 0);
        Self { dimension, data }
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn get(&self, i: usize) -> &[f32] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension)
    }

    /// Index of the centroid closest to `v` in L2 distance.
    pub fn nearest(&self, v: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for (i, c) in self.iter().enumerate() {
            let dist = squared_l2(v, c);
            if dist < best_dist {
                best = i;
                best_dist = dist;
            }
        }
        best
    }

    /// Nearest centroid for every row of `vectors`.
    pub fn assign(&self, vectors: &[f32]) -> Vec<usize> {
        vectors
            .par_chunks_exact(self.dimension)
            .map(|v| self.nearest(v))
            .collect()
    }
}

/// Cluster `vectors` (row-major, `dimension` wide) into `k` groups.
///
/// Requires at least `k` rows. Initial centroids are a seeded random sample
/// of the input, so equal inputs and seeds give equal centroids. Clusters
/// that end up empty are reseeded from a random input row.
pub fn kmeans(
    vectors: &[f32],
    dimension: usize,
    k: usize,
    iterations: usize,
    seed: u64,
) -> Centroids {
    let n = vectors.len() / dimension;
    debug_assert!(n >= k && k > 0);

    let mut rng = StdRng::seed_from_u64(seed);
    let row = |i: usize| &vectors[i * dimension..(i + 1) * dimension];

    let mut data = Vec::with_capacity(k * dimension);
    for i in sample(&mut rng, n, k) {
        data.extend_from_slice(row(i));
    }
    let mut centroids = Centroids::from_vec(dimension, data);
    let mut assignments: Vec<usize> = Vec::new();

    for _ in 0..iterations {
        let next = centroids.assign(vectors);
        if next == assignments {
            break;
        }
        assignments = next;

        let mut sums = vec![0.0f32; k * dimension];
        let mut counts = vec![0usize; k];
        for (i, &cluster) in assignments.iter().enumerate() {
            counts[cluster] += 1;
            let sum = &mut sums[cluster * dimension..(cluster + 1) * dimension];
            for (s, x) in sum.iter_mut().zip(row(i)) {
                *s += x;
            }
        }

        for (cluster, &count) in counts.iter().enumerate() {
            let sum = &mut sums[cluster * dimension..(cluster + 1) * dimension];
            if count == 0 {
                sum.copy_from_slice(row(rng.random_range(0..n)));
            } else {
                for s in sum.iter_mut() {
                    *s /= count as f32;
                }
            }
        }
        centroids = Centroids::from_vec(dimension, sums);
    }

    centroids
}
