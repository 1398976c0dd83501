use std::collections::HashMap;

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::{
    ann::hit_order,
    error::{Error, Result},
};

/// Fixed-width ranked documents for a batch of queries.
///
/// Every row has exactly `k` entries; missing entries are `(-1, -inf)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    index: Vec<Vec<i64>>,
    score: Vec<Vec<f32>>,
    k: usize,
}

impl SearchResult {
    /// Pad `index` and `score` rows to `k` columns.
    ///
    /// Rows longer than `k`, or index and score rows of different lengths,
    /// are rejected with [`Error::ShapeMismatch`].
    ///
    /// # Examples
    ///
    /// ```
    /// use openqa_index::SearchResult;
    ///
    /// let result =
    ///     SearchResult::new(vec![vec![4, 2]], vec![vec![0.9, 0.5]], 3)
    ///         .unwrap();
    /// assert_eq!(result.row(0).0, &[4, 2, -1]);
    /// assert_eq!(result.row(0).1[2], f32::NEG_INFINITY);
    /// ```
    pub fn new(
        mut index: Vec<Vec<i64>>,
        mut score: Vec<Vec<f32>>,
        k: usize,
    ) -> Result<Self> {
        if index.len() != score.len() {
            return Err(Error::ShapeMismatch {
                expected: index.len(),
                actual: score.len(),
            });
        }
        for (ids, scores) in index.iter_mut().zip(&mut score) {
            if ids.len() != scores.len() {
                return Err(Error::ShapeMismatch {
                    expected: ids.len(),
                    actual: scores.len(),
                });
            }
            if ids.len() > k {
                return Err(Error::ShapeMismatch {
                    expected: k,
                    actual: ids.len(),
                });
            }
            ids.resize(k, -1);
            scores.resize(k, f32::NEG_INFINITY);
        }
        Ok(Self { index, score, k })
    }

    /// Result without scores: real ids score `0.0`, padding `-inf`.
    pub fn from_index(index: Vec<Vec<i64>>, k: usize) -> Result<Self> {
        let score = index
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&pid| if pid < 0 { f32::NEG_INFINITY } else { 0.0 })
                    .collect()
            })
            .collect();
        Self::new(index, score, k)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of queries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[Vec<i64>] {
        &self.index
    }

    pub fn score(&self) -> &[Vec<f32>] {
        &self.score
    }

    pub fn row(&self, query: usize) -> (&[i64], &[f32]) {
        (&self.index[query], &self.score[query])
    }

    /// `[Q, k]` id and score tensors.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.len(), self.k);
        let index = self.index.iter().flatten().copied().collect::<Vec<_>>();
        let score = self.score.iter().flatten().copied().collect::<Vec<_>>();
        Ok((
            Tensor::from_vec(index, shape, device)?,
            Tensor::from_vec(score, shape, device)?,
        ))
    }

    /// Stack the queries of `other` below these ones.
    pub fn concat(mut self, other: SearchResult) -> Result<Self> {
        if other.k != self.k {
            return Err(Error::ShapeMismatch {
                expected: self.k,
                actual: other.k,
            });
        }
        self.index.extend(other.index);
        self.score.extend(other.score);
        Ok(self)
    }

    /// Per-query column order by descending score. Equal scores keep their
    /// column order.
    pub fn rank(&self) -> Vec<Vec<usize>> {
        self.score
            .iter()
            .map(|row| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
                order
            })
            .collect()
    }

    /// Merge two results over the same queries.
    ///
    /// Each row keeps every distinct document of both sources with the
    /// higher of its scores, ranked by score (ties by id), and is padded to
    /// `self.k + other.k` columns.
    pub fn union(&self, other: &SearchResult) -> Result<Self> {
        if self.len() != other.len() {
            return Err(Error::ShapeMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }

        let k = self.k + other.k;
        let (index, score): (Vec<_>, Vec<_>) = (0..self.len())
            .map(|q| {
                let mut best: HashMap<i64, f32> = HashMap::new();
                let (ids_a, scores_a) = self.row(q);
                let (ids_b, scores_b) = other.row(q);
                let pairs = ids_a
                    .iter()
                    .zip(scores_a)
                    .chain(ids_b.iter().zip(scores_b));
                for (&pid, &score) in pairs {
                    if pid < 0 {
                        continue;
                    }
                    best.entry(pid)
                        .and_modify(|s| *s = s.max(score))
                        .or_insert(score);
                }

                let mut hits: Vec<(f32, i64)> =
                    best.into_iter().map(|(pid, s)| (s, pid)).collect();
                hits.sort_by(hit_order);
                hits.into_iter()
                    .map(|(s, pid)| (pid, s))
                    .unzip::<_, _, Vec<i64>, Vec<f32>>()
            })
            .unzip();

        Self::new(index, score, k)
    }

    /// Replace every padding id with a uniformly random document id in
    /// `[0, dataset_size)`. Scores stay `-inf`.
    pub fn fill_missing<R: Rng>(
        mut self,
        dataset_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if dataset_size == 0 {
            return Err(Error::Configuration(
                "cannot fill missing results from an empty dataset".into(),
            ));
        }
        for pid in self.index.iter_mut().flatten() {
            if *pid < 0 {
                *pid = rng.random_range(0..dataset_size) as i64;
            }
        }
        Ok(self)
    }
}
