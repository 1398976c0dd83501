use candle_core::{DType, Tensor};
use rayon::prelude::*;

use super::{AnnEngine, Neighbors, top_hits};
use crate::error::{Error, Result};

/// Slots scored per matmul: a query batch of `rows` never holds more than
/// `rows * DEFAULT_SCAN_BLOCK` scores at once.
pub const DEFAULT_SCAN_BLOCK: usize = 16_384;

/// Exhaustive inner-product search over every stored vector.
#[derive(Debug)]
pub struct FlatEngine {
    dimension: usize,
    trained: bool,
    base: Option<Tensor>,
    scan_block: usize,
}

impl FlatEngine {
    pub fn new(dimension: usize) -> Self {
        Self::with_scan_block(dimension, DEFAULT_SCAN_BLOCK)
    }

    /// Score at most `scan_block` slots per step of a search.
    pub fn with_scan_block(dimension: usize, scan_block: usize) -> Self {
        Self {
            dimension,
            trained: false,
            base: None,
            scan_block: scan_block.max(1),
        }
    }
}

impl AnnEngine for FlatEngine {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn ntotal(&self) -> usize {
        self.base
            .as_ref()
            .and_then(|base| base.dim(0).ok())
            .unwrap_or(0)
    }

    fn train(&mut self, vectors: &Tensor) -> Result<()> {
        let (_, d) = vectors.dims2()?;
        if d != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: d,
            });
        }
        self.trained = true;
        Ok(())
    }

    fn add(&mut self, vectors: &Tensor) -> Result<()> {
        if !self.trained {
            return Err(Error::Configuration(
                "engine must be trained before vectors are added".into(),
            ));
        }
        let (n, d) = vectors.dims2()?;
        if d != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: d,
            });
        }
        if n == 0 {
            return Ok(());
        }

        let vectors = vectors.to_dtype(DType::F32)?;
        self.base = Some(match self.base.take() {
            Some(base) => Tensor::cat(&[&base, &vectors], 0)?,
            None => vectors,
        });
        Ok(())
    }

    fn search(&self, queries: &Tensor, depth: usize) -> Result<Neighbors> {
        let (rows, d) = queries.dims2()?;
        if d != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: d,
            });
        }
        let Some(base) = &self.base else {
            return Ok(Neighbors::empty(rows, depth));
        };
        if rows == 0 {
            return Ok(Neighbors::empty(0, depth));
        }

        let queries = queries.to_device(base.device())?.to_dtype(DType::F32)?;
        let ntotal = base.dim(0)?;
        let mut hits: Vec<Vec<(f32, i64)>> = vec![Vec::new(); rows];
        for start in (0..ntotal).step_by(self.scan_block) {
            let len = self.scan_block.min(ntotal - start);
            // [rows, D] x [D, len] -> [rows, len]
            let scores: Vec<Vec<f32>> = queries
                .matmul(&base.narrow(0, start, len)?.t()?)?
                .to_vec2()?;

            hits.par_iter_mut().zip(scores).for_each(|(best, row)| {
                best.extend(
                    row.into_iter()
                        .enumerate()
                        .map(|(i, score)| (score, (start + i) as i64)),
                );
                *best = top_hits(std::mem::take(best), depth);
            });
        }

        Ok(Neighbors::from_hits(depth, hits))
    }
}

/// Brute-force reference used by tests of the approximate engines.
#[cfg(test)]
pub(crate) fn exact_search(
    base: &[f32],
    dimension: usize,
    query: &[f32],
    depth: usize,
) -> Vec<(f32, i64)> {
    let hits = base
        .chunks_exact(dimension)
        .enumerate()
        .map(|(slot, v)| (super::dot(query, v), slot as i64))
        .collect();
    top_hits(hits, depth)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn tensor(data: &[f32], rows: usize, dim: usize) -> Tensor {
        Tensor::from_vec(data.to_vec(), (rows, dim), &Device::Cpu).unwrap()
    }

    fn trained(dim: usize) -> FlatEngine {
        let mut engine = FlatEngine::new(dim);
        engine.train(&tensor(&vec![0.0; dim], 1, dim)).unwrap();
        engine
    }

    #[test]
    fn add_before_train_fails() {
        let mut engine = FlatEngine::new(2);
        let err = engine.add(&tensor(&[1.0, 0.0], 1, 2)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn slots_follow_insertion_order() {
        let mut engine = trained(2);
        engine.add(&tensor(&[1.0, 0.0, 0.0, 1.0], 2, 2)).unwrap();
        engine.add(&tensor(&[0.5, 0.5], 1, 2)).unwrap();
        assert_eq!(engine.ntotal(), 3);

        let result = engine.search(&tensor(&[0.0, 1.0], 1, 2), 3).unwrap();
        let (scores, ids) = result.row(0);
        assert_eq!(ids, &[1, 2, 0]);
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!((scores[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn search_pads_when_depth_exceeds_ntotal() {
        let mut engine = trained(2);
        engine.add(&tensor(&[1.0, 0.0], 1, 2)).unwrap();

        let result = engine.search(&tensor(&[1.0, 0.0], 1, 2), 3).unwrap();
        let (scores, ids) = result.row(0);
        assert_eq!(ids, &[0, -1, -1]);
        assert_eq!(scores[2], f32::NEG_INFINITY);
    }

    #[test]
    fn empty_engine_returns_padding() {
        let engine = trained(2);
        let result = engine
            .search(&tensor(&[1.0, 0.0, 0.0, 1.0], 2, 2), 2)
            .unwrap();
        assert_eq!(result.ids(), &[-1, -1, -1, -1]);
    }

    #[test]
    fn ties_rank_lower_slot_first() {
        let mut engine = trained(2);
        engine
            .add(&tensor(&[1.0, 0.0, 1.0, 0.0, 1.0, 0.0], 3, 2))
            .unwrap();
        let result = engine.search(&tensor(&[1.0, 0.0], 1, 2), 2).unwrap();
        assert_eq!(result.row(0).1, &[0, 1]);
    }

    #[test]
    fn query_dimension_is_checked() {
        let engine = trained(2);
        let err = engine.search(&tensor(&[1.0, 0.0, 0.0], 1, 3), 1).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn blocked_scan_matches_single_block() {
        let base: Vec<f32> =
            (0..80).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
        let queries = [1.0, -2.0, 3.0, 0.0, 0.0, 1.0, -1.0, 2.0, -3.0, 0.0, 1.0, 1.0];

        let mut whole = FlatEngine::with_scan_block(4, 1_000);
        whole.train(&tensor(&base, 20, 4)).unwrap();
        whole.add(&tensor(&base, 20, 4)).unwrap();
        let expected = whole.search(&tensor(&queries, 3, 4), 5).unwrap();

        for block in [1, 3, 7, 20] {
            let mut blocked = FlatEngine::with_scan_block(4, block);
            blocked.train(&tensor(&base, 20, 4)).unwrap();
            blocked.add(&tensor(&base[..32], 8, 4)).unwrap();
            blocked.add(&tensor(&base[32..], 12, 4)).unwrap();
            let got = blocked.search(&tensor(&queries, 3, 4), 5).unwrap();
            assert_eq!(got, expected, "scan block {block}");
        }
    }

    #[test]
    fn matches_exact_reference() {
        let base: Vec<f32> = (0..40).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
        let mut engine = trained(4);
        engine.add(&tensor(&base, 10, 4)).unwrap();

        let query = [0.3, -1.0, 2.0, 0.5];
        let result = engine.search(&tensor(&query, 1, 4), 4).unwrap();
        let expected = exact_search(&base, 4, &query, 4);
        for (got, (want, _)) in result.row(0).0.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-5);
        }
    }
}
