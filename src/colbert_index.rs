//! The multi-vector retrieval index.
//!
//! Every token embedding of every document is a slot in an ANN engine.
//! Searching runs in two stages: each genuine query token retrieves its
//! nearest slots, the slots collapse to candidate documents, and the
//! candidates are re-scored with MaxSim over their full token matrices.

use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

use candle_core::{DType, Tensor};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    ann::{AnnEngine, Neighbors, new_engine, top_hits},
    candidates::CandidateAggregator,
    config::{IndexConfig, Similarity},
    encoder::QueryEncoder,
    error::{Error, Result},
    index_dir::IndexDir,
    maxsim::{MaxSimScorer, normalize},
    search_result::SearchResult,
    token_map::TokenDocumentMap,
    vector_store::{InMemoryStore, VectorStore, chunk_ranges, gather_candidates},
    vector_table::VectorTable,
};

pub struct ColbertIndex {
    config: IndexConfig,
    store: Arc<dyn VectorStore>,
    engine: Box<dyn AnnEngine>,
    token_map: OnceLock<TokenDocumentMap>,
    aggregator: CandidateAggregator,
    scorer: MaxSimScorer,
}

impl ColbertIndex {
    /// Index every document of `store`.
    ///
    /// The engine is trained on the first `train_sample_docs` documents
    /// (spread evenly over the corpus) and then receives all token vectors
    /// in document order, so slot `s` belongs to document `s / T`.
    pub fn build(store: Arc<dyn VectorStore>, config: IndexConfig) -> Result<Self> {
        config.validate(store.dimension())?;
        let engine = build_engine(store.as_ref(), &config)?;

        Ok(Self {
            aggregator: CandidateAggregator::new(config.max_candidates),
            scorer: MaxSimScorer::new(config.similarity),
            config,
            store,
            engine,
            token_map: OnceLock::new(),
        })
    }

    /// Load an index persisted with [`persist`](Self::persist).
    ///
    /// The stored configuration is read from `index.json` and overridden by
    /// the environment. The vector table and the stored token map are
    /// checked against each other, and the engine is rebuilt from the
    /// table.
    pub fn open(dir: &IndexDir) -> Result<Self> {
        if !dir.is_populated() {
            return Err(Error::IndexCorruption(format!(
                "no persisted index in {}",
                dir.root().display()
            )));
        }

        let mut config = IndexConfig::load(&dir.config_file())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;

        let table = VectorTable::open(&dir.vectors_db())?;
        table.verify()?;
        config.validate(table.dimension())?;

        let slots = table.read_token_map()?.ok_or_else(|| {
            Error::IndexCorruption(
                "vector table has no token-to-document map".into(),
            )
        })?;
        let token_map = TokenDocumentMap::from_slots(
            slots,
            table.num_docs(),
            table.tokens_per_doc(),
        )?;

        let store: Arc<dyn VectorStore> = if config.in_memory {
            Arc::new(InMemoryStore::load_from(
                &table,
                config.max_chunk_rows,
                config.memory_budget_bytes,
            )?)
        } else {
            Arc::new(table)
        };

        let mut index = Self::build(store, config)?;
        index.token_map = OnceLock::from(token_map);
        Ok(index)
    }

    /// Write the token map into `table` and the configuration next to it.
    ///
    /// `table` must hold the same documents the index was built from.
    pub fn persist(&self, dir: &IndexDir, table: &VectorTable) -> Result<()> {
        fn shape(s: &dyn VectorStore) -> (usize, usize, usize) {
            (s.num_docs(), s.tokens_per_doc(), s.dimension())
        }
        if shape(table) != shape(self.store.as_ref()) {
            return Err(Error::IndexCorruption(format!(
                "table holds {:?} documents, index was built over {:?}",
                shape(table),
                shape(self.store.as_ref())
            )));
        }

        table.write_token_map(self.token_map().as_slice())?;
        self.config.save(&dir.config_file())?;
        info!(
            documents = table.num_docs(),
            path = %dir.root().display(),
            "Persisted index"
        );
        Ok(())
    }

    /// Retrain the engine from the store and drop derived state.
    pub fn rebuild(&mut self) -> Result<()> {
        self.engine = build_engine(self.store.as_ref(), &self.config)?;
        self.token_map = OnceLock::new();
        Ok(())
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn engine(&self) -> &dyn AnnEngine {
        self.engine.as_ref()
    }

    pub fn num_docs(&self) -> usize {
        self.store.num_docs()
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }

    /// Slot-to-document map, derived on first use.
    pub fn token_map(&self) -> &TokenDocumentMap {
        self.token_map.get_or_init(|| {
            TokenDocumentMap::build(
                self.store.num_docs(),
                self.store.tokens_per_doc(),
            )
        })
    }

    /// Token-level neighbors retrieved per query token for a final `k`.
    pub fn search_depth(&self, k: usize) -> usize {
        self.config.search_depth(k)
    }

    /// Encode `queries` and search them.
    ///
    /// The encoder output is checked against the index dimension before
    /// anything is searched.
    pub fn search(
        &self,
        encoder: &mut dyn QueryEncoder,
        queries: &[String],
        k: usize,
    ) -> Result<SearchResult> {
        let embeddings = encoder.encode_queries(queries)?;
        let (n, _, d) = embeddings.dims3()?;
        if d != self.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.dimension(),
                actual: d,
            });
        }
        if n != queries.len() {
            return Err(Error::ShapeMismatch {
                expected: queries.len(),
                actual: n,
            });
        }
        self.search_embeddings(&embeddings, k)
    }

    /// Top-`k` documents for `[Q, Tq, D]` query token embeddings.
    ///
    /// All-zero token vectors are padding. The result always has `Q` rows
    /// of exactly `k` entries; missing entries are `(-1, -inf)`.
    pub fn search_embeddings(
        &self,
        queries: &Tensor,
        k: usize,
    ) -> Result<SearchResult> {
        let (num_queries, query_tokens, d) = queries.dims3()?;
        if d != self.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.dimension(),
                actual: d,
            });
        }
        if k == 0 {
            return Err(Error::Configuration("k must be at least 1".into()));
        }
        if num_queries == 0 || query_tokens == 0 {
            return SearchResult::new(
                vec![Vec::new(); num_queries],
                vec![Vec::new(); num_queries],
                k,
            );
        }

        let started = Instant::now();
        let depth = self.search_depth(k);
        let queries = queries.to_dtype(DType::F32)?;

        let flat = queries.reshape((num_queries * query_tokens, d))?;
        let neighbors = self.search_tokens(&flat, depth)?;
        let ann_done = started.elapsed();

        let candidates = self.aggregator.aggregate(
            self.token_map(),
            &neighbors,
            query_tokens,
            k,
        )?;
        let documents = gather_candidates(
            self.store.as_ref(),
            candidates.pids(),
            self.config.max_chunk_rows,
        )?;
        let scores = self.scorer.score(&queries, &documents, candidates.pids())?;

        let (index, score): (Vec<_>, Vec<_>) = scores
            .into_par_iter()
            .zip(candidates.pids().par_iter())
            .map(|(scores, pids)| {
                let hits = scores
                    .into_iter()
                    .zip(pids.iter().copied())
                    .filter(|&(s, pid)| pid >= 0 && s > f32::NEG_INFINITY)
                    .collect();
                top_hits(hits, k)
                    .into_iter()
                    .map(|(s, pid)| (pid, s))
                    .unzip::<_, _, Vec<i64>, Vec<f32>>()
            })
            .unzip();

        debug!(
            queries = num_queries,
            depth,
            candidates = candidates.width(),
            ann_ms = ann_done.as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "search"
        );

        SearchResult::new(index, score, k)
    }

    /// Run the engine on genuine query tokens only, at most
    /// `max_query_batch` rows per call. Padding rows get no neighbors.
    ///
    /// Under cosine similarity the engine holds unit vectors, so query rows
    /// are normalized to rank slots by cosine.
    fn search_tokens(&self, flat: &Tensor, depth: usize) -> Result<Neighbors> {
        let rows = flat.dim(0)?;
        let genuine: Vec<u32> = flat
            .sqr()?
            .sum(1)?
            .to_vec1::<f32>()?
            .into_iter()
            .enumerate()
            .filter(|&(_, norm)| norm > 0.0)
            .map(|(row, _)| row as u32)
            .collect();
        let flat = engine_space(flat, self.config.similarity)?;

        let mut hits: Vec<Vec<(f32, i64)>> = vec![Vec::new(); rows];
        for batch in genuine.chunks(self.config.max_query_batch) {
            let ids = Tensor::from_slice(batch, batch.len(), flat.device())?;
            let found = self.engine.search(&flat.index_select(&ids, 0)?, depth)?;
            for (i, &row) in batch.iter().enumerate() {
                let (scores, slots) = found.row(i);
                hits[row as usize] = scores
                    .iter()
                    .copied()
                    .zip(slots.iter().copied())
                    .filter(|&(_, slot)| slot >= 0)
                    .collect();
            }
        }

        Ok(Neighbors::from_hits(depth, hits))
    }
}

impl std::fmt::Debug for ColbertIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertIndex")
            .field("num_docs", &self.store.num_docs())
            .field("tokens_per_doc", &self.store.tokens_per_doc())
            .field("dimension", &self.store.dimension())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

fn build_engine(
    store: &dyn VectorStore,
    config: &IndexConfig,
) -> Result<Box<dyn AnnEngine>> {
    let started = Instant::now();
    let num_docs = store.num_docs();
    let tokens = store.tokens_per_doc();
    let dimension = store.dimension();
    let mut engine = new_engine(&config.engine, dimension)?;

    let sample = config.train_sample_docs.map_or(num_docs, |s| s.min(num_docs));
    let sample_pids: Vec<i64> = (0..sample)
        .map(|i| (i * num_docs / sample) as i64)
        .collect();
    let training = engine_space(
        &store
            .get(&sample_pids, config.max_chunk_rows)?
            .reshape((sample * tokens, dimension))?,
        config.similarity,
    )?;
    engine.train(&training)?;
    drop(training);

    for range in chunk_ranges(num_docs, config.max_chunk_rows) {
        let pids: Vec<i64> = range.map(|pid| pid as i64).collect();
        let vectors = store
            .get(&pids, config.max_chunk_rows)?
            .reshape((pids.len() * tokens, dimension))?;
        engine.add(&engine_space(&vectors, config.similarity)?)?;
    }

    if engine.ntotal() != num_docs * tokens {
        return Err(Error::IndexCorruption(format!(
            "engine holds {} token vectors, expected {}",
            engine.ntotal(),
            num_docs * tokens
        )));
    }

    info!(
        documents = num_docs,
        tokens = engine.ntotal(),
        trained_on = sample,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Built token index"
    );
    Ok(engine)
}

/// Vectors as the engine sees them: unit length under cosine similarity,
/// unchanged under dot product.
fn engine_space(vectors: &Tensor, similarity: Similarity) -> Result<Tensor> {
    match similarity {
        Similarity::Dot => Ok(vectors.clone()),
        Similarity::Cosine => normalize(vectors),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::{
        config::{EngineConfig, IvfPqParams},
        encoder::PrecomputedEncoder,
    };

    fn store(data: &[f32], shape: (usize, usize, usize)) -> Arc<dyn VectorStore> {
        let vectors = Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap();
        Arc::new(InMemoryStore::new(vectors).unwrap())
    }

    fn queries(data: &[f32], shape: (usize, usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    /// Five documents of one 2-d token each, at increasing angles.
    fn five_docs() -> ColbertIndex {
        let data = [1.0, 0.0, 0.9, 0.1, 0.5, 0.5, 0.1, 0.9, 0.0, 1.0];
        ColbertIndex::build(store(&data, (5, 1, 2)), IndexConfig::default())
            .unwrap()
    }

    #[test]
    fn best_document_ranks_first() {
        let index = five_docs();
        let result = index
            .search_embeddings(&queries(&[0.0, 1.0], (1, 1, 2)), 2)
            .unwrap();
        let (ids, scores) = result.row(0);
        assert_eq!(ids[0], 4);
        assert!((scores[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_retrieves_by_direction_not_length() {
        // A long off-direction token against a unit token aligned with the
        // query; the default depth for k = 1 retrieves a single slot.
        let config = IndexConfig {
            similarity: Similarity::Cosine,
            ..Default::default()
        };
        let index =
            ColbertIndex::build(store(&[10.0, 10.0, 1.0, 0.0], (2, 1, 2)), config)
                .unwrap();
        assert_eq!(index.search_depth(1), 1);

        let query = queries(&[1.0, 0.0], (1, 1, 2));
        let result = index.search_embeddings(&query, 1).unwrap();
        assert_eq!(result.row(0).0, &[1]);
        assert!((result.row(0).1[0] - 1.0).abs() < 1e-6);

        let result = index.search_embeddings(&query, 2).unwrap();
        assert_eq!(result.row(0).0, &[1, -1]);
    }

    #[test]
    fn padding_query_token_is_not_searched() {
        let index = five_docs();
        let with_padding = queries(&[0.0, 1.0, 0.0, 0.0], (1, 2, 2));
        let result = index.search_embeddings(&with_padding, 1).unwrap();
        assert_eq!(result.row(0).0, &[4]);
        assert!((result.row(0).1[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn all_padding_query_returns_only_sentinels() {
        let index = five_docs();
        let result = index
            .search_embeddings(&queries(&[0.0; 4], (1, 2, 2)), 3)
            .unwrap();
        assert_eq!(result.row(0).0, &[-1, -1, -1]);
        assert!(result.row(0).1.iter().all(|s| *s == f32::NEG_INFINITY));
    }

    #[test]
    fn dimension_mismatch_fails_before_search() {
        let index = five_docs();
        let err = index
            .search_embeddings(&queries(&[1.0, 0.0, 0.0], (1, 1, 3)), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));

        let mut encoder = PrecomputedEncoder::new(3);
        encoder
            .insert("q", Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let err = index
            .search(&mut encoder, &["q".to_string()], 1)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn zero_k_is_rejected() {
        let index = five_docs();
        let err = index
            .search_embeddings(&queries(&[1.0, 0.0], (1, 1, 2)), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn token_map_is_lazy_and_reset_by_rebuild() {
        let mut index = five_docs();
        assert!(index.token_map.get().is_none());
        assert_eq!(index.token_map().len(), 5);
        assert!(index.token_map.get().is_some());

        index.rebuild().unwrap();
        assert!(index.token_map.get().is_none());
        assert_eq!(index.engine().ntotal(), 5);
    }

    #[test]
    fn small_query_batches_give_same_result() {
        let data = [1.0, 0.0, 0.9, 0.1, 0.5, 0.5, 0.1, 0.9, 0.0, 1.0];
        let batched = ColbertIndex::build(
            store(&data, (5, 1, 2)),
            IndexConfig {
                max_query_batch: 1,
                max_chunk_rows: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let q = queries(&[1.0, 0.0, 0.3, 0.7, 0.0, 1.0, 0.6, 0.4], (2, 2, 2));
        let a = batched.search_embeddings(&q, 3).unwrap();
        let b = five_docs().search_embeddings(&q, 3).unwrap();
        assert_eq!(a.index(), b.index());
        for (x, y) in a.score().iter().flatten().zip(b.score().iter().flatten()) {
            assert!(x == y || (x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn ivf_pq_engine_finds_exact_match() {
        let mut data = Vec::new();
        for i in 0..64 {
            let angle = i as f32 * 0.1;
            data.extend_from_slice(&[angle.cos(), angle.sin(), 0.0, 0.0]);
        }
        let config = IndexConfig {
            engine: EngineConfig::IvfPq(IvfPqParams {
                nlist: 4,
                nprobe: 4,
                subvectors: 2,
                codebook_size: 64,
                iterations: 10,
                seed: 1,
            }),
            ..Default::default()
        };
        let index = ColbertIndex::build(store(&data, (32, 2, 4)), config).unwrap();
        assert_eq!(index.engine().ntotal(), 64);

        let q = queries(&data[40..44], (1, 1, 4));
        let result = index.search_embeddings(&q, 1).unwrap();
        assert_eq!(result.row(0).0, &[5]);
    }

    #[test]
    fn invalid_config_fails_before_indexing() {
        let config = IndexConfig {
            engine: EngineConfig::IvfPq(IvfPqParams {
                subvectors: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = ColbertIndex::build(store(&[0.0; 4], (1, 1, 4)), config)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
