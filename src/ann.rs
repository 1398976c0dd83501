//! Approximate nearest-neighbor engines over flattened token vectors.
//!
//! Every row handed to [`AnnEngine::add`] becomes a token slot whose id is
//! the number of rows added before it. Searches rank by inner product,
//! highest first.

use std::cmp::Ordering;

use candle_core::{DType, Tensor};

use crate::{
    config::EngineConfig,
    error::{Error, Result},
};

pub mod flat;
pub mod ivf_pq;
pub mod kmeans;

pub use flat::FlatEngine;
pub use ivf_pq::IvfPqEngine;

/// Capability set shared by every nearest-neighbor backend.
pub trait AnnEngine: Send + Sync + std::fmt::Debug {
    fn dimension(&self) -> usize;

    fn is_trained(&self) -> bool;

    /// Number of token slots added so far.
    fn ntotal(&self) -> usize;

    /// Fit data-dependent structures on `[n, D]` training vectors. Must run
    /// before the first `add`.
    fn train(&mut self, vectors: &Tensor) -> Result<()>;

    /// Append `[n, D]` vectors as slots `ntotal..ntotal + n`.
    fn add(&mut self, vectors: &Tensor) -> Result<()>;

    /// Up to `depth` best slots for each `[N, D]` query row.
    fn search(&self, queries: &Tensor, depth: usize) -> Result<Neighbors>;
}

/// Construct the engine selected by configuration.
pub fn new_engine(
    config: &EngineConfig,
    dimension: usize,
) -> Result<Box<dyn AnnEngine>> {
    Ok(match config {
        EngineConfig::Flat => Box::new(FlatEngine::new(dimension)),
        EngineConfig::IvfPq(params) => {
            Box::new(IvfPqEngine::new(dimension, *params)?)
        }
    })
}

/// Search output: `rows x depth` scores and slot ids, best first.
///
/// Missing neighbors are padded with id `-1` and score `-inf`.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbors {
    depth: usize,
    scores: Vec<f32>,
    ids: Vec<i64>,
}

impl Neighbors {
    /// `rows` rows of padding only.
    pub fn empty(rows: usize, depth: usize) -> Self {
        Self {
            depth,
            scores: vec![f32::NEG_INFINITY; rows * depth],
            ids: vec![-1; rows * depth],
        }
    }

    /// Pack ranked hits per row, truncating or padding to `depth`.
    pub fn from_hits(depth: usize, rows: Vec<Vec<(f32, i64)>>) -> Self {
        let mut out = Self::empty(rows.len(), depth);
        for (r, hits) in rows.into_iter().enumerate() {
            for (c, (score, id)) in hits.into_iter().take(depth).enumerate() {
                out.scores[r * depth + c] = score;
                out.ids[r * depth + c] = id;
            }
        }
        out
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn rows(&self) -> usize {
        self.ids.len().checked_div(self.depth).unwrap_or(0)
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn row(&self, i: usize) -> (&[f32], &[i64]) {
        let range = i * self.depth..(i + 1) * self.depth;
        (&self.scores[range.clone()], &self.ids[range])
    }
}

/// Ranking order of hits: higher score first, then lower id.
pub(crate) fn hit_order(a: &(f32, i64), b: &(f32, i64)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

/// Keep the `depth` best hits in ranking order.
pub(crate) fn top_hits(mut hits: Vec<(f32, i64)>, depth: usize) -> Vec<(f32, i64)> {
    if depth == 0 {
        return Vec::new();
    }
    if hits.len() > depth {
        hits.select_nth_unstable_by(depth - 1, hit_order);
        hits.truncate(depth);
    }
    hits.sort_by(hit_order);
    hits
}

/// Flatten a `[n, D]` tensor after checking its width.
pub(crate) fn matrix_rows(tensor: &Tensor, dimension: usize) -> Result<Vec<f32>> {
    let (_, d) = tensor.dims2()?;
    if d != dimension {
        return Err(Error::DimensionMismatch {
            expected: dimension,
            actual: d,
        });
    }
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
