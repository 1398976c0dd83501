use candle_core::{D, DType, Tensor};
use rayon::prelude::*;

use crate::{
    config::Similarity,
    error::{Error, Result},
};

/// Late-interaction scorer.
///
/// For each query token take the best similarity to any document token,
/// then average over the query's genuine tokens. All-zero query token
/// vectors are padding: they are left out of the average, and a query made
/// only of padding scores `-inf` against everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxSimScorer {
    similarity: Similarity,
}

impl MaxSimScorer {
    pub fn new(similarity: Similarity) -> Self {
        Self { similarity }
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    /// Score gathered candidates.
    ///
    /// `queries` is `[Q, Tq, D]`, `documents` is `[Q, p, T, D]` and
    /// `candidates` holds the `[Q, p]` pids the documents were gathered
    /// for. Sentinel candidates (`-1`) score `-inf`. Returns `[Q, p]`.
    pub fn score(
        &self,
        queries: &Tensor,
        documents: &Tensor,
        candidates: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>> {
        let (num_queries, query_tokens, dim) = queries.dims3()?;
        let (doc_queries, width, doc_tokens, doc_dim) = documents.dims4()?;
        if doc_queries != num_queries {
            return Err(Error::ShapeMismatch {
                expected: num_queries,
                actual: doc_queries,
            });
        }
        if doc_dim != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: doc_dim,
            });
        }
        if candidates.len() != num_queries {
            return Err(Error::ShapeMismatch {
                expected: num_queries,
                actual: candidates.len(),
            });
        }
        if let Some(row) = candidates.iter().find(|row| row.len() != width) {
            return Err(Error::ShapeMismatch {
                expected: width,
                actual: row.len(),
            });
        }
        if num_queries == 0 || width == 0 {
            return Ok(vec![Vec::new(); num_queries]);
        }

        let documents = documents.to_dtype(DType::F32)?;
        let queries = queries
            .to_device(documents.device())?
            .to_dtype(DType::F32)?;

        // Padding is decided on the raw vectors, before any normalization.
        let genuine: Vec<Vec<bool>> = queries
            .sqr()?
            .sum(D::Minus1)?
            .to_vec2::<f32>()?
            .into_iter()
            .map(|row| row.into_iter().map(|norm| norm > 0.0).collect())
            .collect();

        let (queries, documents) = match self.similarity {
            Similarity::Dot => (queries, documents),
            Similarity::Cosine => (normalize(&queries)?, normalize(&documents)?),
        };

        // [Q, Tq, D] x [Q, D, p*T] -> [Q, Tq, p, T] -> max over T
        let flat_docs = documents
            .reshape((num_queries, width * doc_tokens, dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let best: Vec<Vec<Vec<f32>>> = queries
            .contiguous()?
            .matmul(&flat_docs)?
            .reshape((num_queries, query_tokens, width, doc_tokens))?
            .max(3)?
            .to_vec3()?;

        let scores: Vec<Vec<f32>> = best
            .into_par_iter()
            .zip(genuine.into_par_iter())
            .zip(candidates.par_iter())
            .map(|((best, genuine), pids)| {
                let count = genuine.iter().filter(|&&g| g).count();
                pids.iter()
                    .enumerate()
                    .map(|(c, &pid)| {
                        if pid < 0 || count == 0 {
                            return f32::NEG_INFINITY;
                        }
                        let total: f32 = best
                            .iter()
                            .zip(&genuine)
                            .filter(|(_, g)| **g)
                            .map(|(row, _)| row[c])
                            .sum();
                        total / count as f32
                    })
                    .collect::<Vec<f32>>()
            })
            .collect();

        Ok(scores)
    }

    /// Score one `[Tq, D]` query against one `[T, D]` document.
    pub fn score_pair(&self, query: &Tensor, document: &Tensor) -> Result<f32> {
        let queries = query.unsqueeze(0)?;
        let documents = document.unsqueeze(0)?.unsqueeze(0)?;
        let scores = self.score(&queries, &documents, &[vec![0]])?;
        Ok(scores[0][0])
    }
}

/// Scale every vector along the last axis to unit length. Zero vectors stay
/// zero.
/// Scale every vector along the last axis to unit length. Zero vectors
/// stay zero.
pub(crate) fn normalize(t: &Tensor) -> Result<Tensor> {
    let norms = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    Ok(t.broadcast_div(&norms)?)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn make_tensor(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn identical_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], &[1, 3]);
        let d = make_tensor(&[1.0, 0.0, 0.0], &[1, 3]);
        let score = MaxSimScorer::default().score_pair(&q, &d).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mean_over_query_tokens() {
        // 2 query tokens, 3 doc tokens, dim=2
        // q[0]=[1,0] best match d[0] = 1.0
        // q[1]=[0,2] best match d[1] = 2.0
        // mean = 1.5
        let q = make_tensor(&[1.0, 0.0, 0.0, 2.0], &[2, 2]);
        let d = make_tensor(&[1.0, 0.0, 0.0, 1.0, 0.5, 0.5], &[3, 2]);
        let score = MaxSimScorer::default().score_pair(&q, &d).unwrap();
        assert!((score - 1.5).abs() < 1e-6);
    }

    #[test]
    fn padding_tokens_are_excluded_from_mean() {
        let q = make_tensor(&[1.0, 0.0, 0.0, 0.0], &[2, 2]);
        let d = make_tensor(&[1.0, 0.0], &[1, 2]);
        let score = MaxSimScorer::default().score_pair(&q, &d).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn all_padding_query_scores_neg_inf() {
        let q = make_tensor(&[0.0; 4], &[2, 2]);
        let d = make_tensor(&[1.0, 0.0], &[1, 2]);
        let score = MaxSimScorer::default().score_pair(&q, &d).unwrap();
        assert_eq!(score, f32::NEG_INFINITY);
    }

    #[test]
    fn cosine_ignores_magnitude() {
        let q = make_tensor(&[3.0, 0.0], &[1, 2]);
        let d = make_tensor(&[5.0, 0.0, 0.0, 2.0], &[2, 2]);
        let scorer = MaxSimScorer::new(Similarity::Cosine);
        assert!((scorer.score_pair(&q, &d).unwrap() - 1.0).abs() < 1e-6);
        let dot = MaxSimScorer::new(Similarity::Dot);
        assert!((dot.score_pair(&q, &d).unwrap() - 15.0).abs() < 1e-5);
    }

    #[test]
    fn sentinel_candidates_score_neg_inf() {
        // One query, two candidate slots; the second is padding with a zero
        // document matrix.
        let q = make_tensor(&[1.0, 1.0], &[1, 1, 2]);
        let docs = make_tensor(&[1.0, 0.0, 0.0, 0.0], &[1, 2, 1, 2]);
        let scores = MaxSimScorer::default()
            .score(&q, &docs, &[vec![7, -1]])
            .unwrap();
        assert!((scores[0][0] - 1.0).abs() < 1e-6);
        assert_eq!(scores[0][1], f32::NEG_INFINITY);
    }

    #[test]
    fn batched_matches_pairwise() {
        let q = make_tensor(
            &[1.0, 0.5, -0.5, 2.0, 0.0, 1.0, 1.0, 1.0],
            &[2, 2, 2],
        );
        let docs = make_tensor(
            &[
                0.1, 0.2, 0.3, 0.4, // q0 cand0
                -1.0, 0.5, 0.5, 0.5, // q0 cand1
                2.0, 0.0, 0.0, 2.0, // q1 cand0
                1.0, -1.0, 0.0, 0.1, // q1 cand1
            ],
            &[2, 2, 2, 2],
        );
        let scorer = MaxSimScorer::default();
        let scores = scorer.score(&q, &docs, &[vec![0, 1], vec![2, 3]]).unwrap();

        for qi in 0..2 {
            for c in 0..2 {
                let query = q.get(qi).unwrap();
                let doc = docs.get(qi).unwrap().get(c).unwrap();
                let expected = scorer.score_pair(&query, &doc).unwrap();
                assert!((scores[qi][c] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let q = make_tensor(&[1.0, 0.0, 0.0], &[1, 1, 3]);
        let docs = make_tensor(&[1.0, 0.0], &[1, 1, 1, 2]);
        let err = MaxSimScorer::default()
            .score(&q, &docs, &[vec![0]])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn candidate_rows_must_match_documents() {
        let q = make_tensor(&[1.0, 0.0], &[1, 1, 2]);
        let docs = make_tensor(&[1.0, 0.0, 0.0, 1.0], &[1, 2, 1, 2]);
        let err = MaxSimScorer::default()
            .score(&q, &docs, &[vec![0]])
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
