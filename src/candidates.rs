use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::warn;

use crate::{
    ann::Neighbors,
    error::{Error, Result},
    token_map::TokenDocumentMap,
};

/// Padded per-query candidate documents, `[Q, width]`.
///
/// Candidates of a query are sorted by ascending pid and followed by
/// sentinel `-1` entries. Alongside every candidate the set keeps how many
/// of the query's token hits landed on it and the sum of their ANN scores.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    width: usize,
    pids: Vec<Vec<i64>>,
    token_score_sums: Vec<Vec<f32>>,
    hit_counts: Vec<Vec<u32>>,
}

impl CandidateSet {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn num_queries(&self) -> usize {
        self.pids.len()
    }

    pub fn pids(&self) -> &[Vec<i64>] {
        &self.pids
    }

    pub fn row(&self, query: usize) -> &[i64] {
        &self.pids[query]
    }

    /// Sum of the token-level ANN scores behind each candidate (`-inf` for
    /// padding).
    pub fn token_score_sums(&self, query: usize) -> &[f32] {
        &self.token_score_sums[query]
    }

    pub fn hit_counts(&self, query: usize) -> &[u32] {
        &self.hit_counts[query]
    }

    /// Number of real candidates of a query.
    pub fn len_of(&self, query: usize) -> usize {
        self.pids[query].iter().take_while(|&&pid| pid >= 0).count()
    }
}

/// Reduces token-level neighbor hits to per-query document candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateAggregator {
    max_candidates: Option<usize>,
}

impl CandidateAggregator {
    pub fn new(max_candidates: Option<usize>) -> Self {
        Self { max_candidates }
    }

    /// Group `neighbors` (one row per query token, `tokens_per_query` rows
    /// per query) into candidate documents and pad every row to
    /// `max(k, largest candidate count)`.
    pub fn aggregate(
        &self,
        map: &TokenDocumentMap,
        neighbors: &Neighbors,
        tokens_per_query: usize,
        k: usize,
    ) -> Result<CandidateSet> {
        let rows = neighbors.rows();
        if tokens_per_query == 0 || rows % tokens_per_query != 0 {
            return Err(Error::ShapeMismatch {
                expected: rows.next_multiple_of(tokens_per_query.max(1)),
                actual: rows,
            });
        }
        let per_query = tokens_per_query * neighbors.depth();

        let grouped = neighbors
            .ids()
            .par_chunks(per_query.max(1))
            .zip(neighbors.scores().par_chunks(per_query.max(1)))
            .map(|(slots, scores)| {
                let mut by_pid: BTreeMap<i64, (f32, u32)> = BTreeMap::new();
                for (&slot, &score) in slots.iter().zip(scores) {
                    let pid = map.document(slot)?;
                    if pid < 0 {
                        continue;
                    }
                    let entry = by_pid.entry(pid).or_insert((0.0, 0));
                    entry.0 += score;
                    entry.1 += 1;
                }
                Ok(by_pid.into_iter().collect::<Vec<_>>())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut truncated = 0;
        let grouped: Vec<Vec<(i64, (f32, u32))>> = grouped
            .into_iter()
            .map(|mut cands| {
                if let Some(max) = self.max_candidates
                    && cands.len() > max
                {
                    truncated += 1;
                    cands.sort_by(|a, b| {
                        b.1.0.total_cmp(&a.1.0).then(a.0.cmp(&b.0))
                    });
                    cands.truncate(max);
                    cands.sort_by_key(|&(pid, _)| pid);
                }
                cands
            })
            .collect();
        if truncated > 0 {
            warn!(
                queries = truncated,
                max_candidates = self.max_candidates,
                "candidate sets truncated by token score"
            );
        }

        let width = grouped.iter().map(Vec::len).max().unwrap_or(0).max(k);
        let mut set = CandidateSet {
            width,
            pids: Vec::with_capacity(grouped.len()),
            token_score_sums: Vec::with_capacity(grouped.len()),
            hit_counts: Vec::with_capacity(grouped.len()),
        };
        for cands in grouped {
            let mut pids = vec![-1; width];
            let mut sums = vec![f32::NEG_INFINITY; width];
            let mut counts = vec![0; width];
            for (i, (pid, (sum, count))) in cands.into_iter().enumerate() {
                pids[i] = pid;
                sums[i] = sum;
                counts[i] = count;
            }
            set.pids.push(pids);
            set.token_score_sums.push(sums);
            set.hit_counts.push(counts);
        }
        Ok(set)
    }
}
