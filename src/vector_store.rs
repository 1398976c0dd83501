use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    corpus::CorpusProvider,
    encoder::default_device,
    error::{Error, Result},
};

/// Random-access storage of per-document token embedding matrices.
///
/// Implementations only provide [`fetch`](VectorStore::fetch), a single
/// underlying read; [`get`](VectorStore::get) splits large requests into
/// bounded chunks, fetches them in parallel and reassembles them in
/// request order.
pub trait VectorStore: Send + Sync {
    fn num_docs(&self) -> usize;
    fn tokens_per_doc(&self) -> usize;
    fn dimension(&self) -> usize;

    /// Read the matrices of `pids` in one request, shaped `[n, T, D]`.
    fn fetch(&self, pids: &[i64]) -> Result<Tensor>;

    /// Read the matrices of `pids`, never asking the backend for more than
    /// `max_chunk_rows` rows at once.
    fn get(&self, pids: &[i64], max_chunk_rows: usize) -> Result<Tensor> {
        let tokens = self.tokens_per_doc();
        let dimension = self.dimension();

        if pids.is_empty() {
            return Ok(Tensor::zeros(
                (0, tokens, dimension),
                DType::F32,
                &Device::Cpu,
            )?);
        }

        let mut parts = pids
            .par_chunks(max_chunk_rows.max(1))
            .map(|chunk| {
                let rows = self.fetch(chunk)?;
                let (n, t, d) = rows.dims3()?;
                if n != chunk.len() {
                    return Err(Error::ShapeMismatch {
                        expected: chunk.len(),
                        actual: n,
                    });
                }
                if d != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        actual: d,
                    });
                }
                if t != tokens {
                    return Err(Error::IndexCorruption(format!(
                        "fetched documents have {t} tokens, expected {tokens}"
                    )));
                }
                Ok(rows)
            })
            .collect::<Result<Vec<Tensor>>>()?;

        if parts.len() == 1 {
            return Ok(parts.remove(0));
        }
        Ok(Tensor::cat(&parts, 0)?)
    }
}

/// All document vectors resident in one `[N, T, D]` tensor.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    vectors: Tensor,
}

impl InMemoryStore {
    pub fn new(vectors: Tensor) -> Result<Self> {
        let (_, tokens_per_doc, dimension) = vectors.dims3()?;
        if tokens_per_doc == 0 || dimension == 0 {
            return Err(Error::Configuration(
                "documents need at least one token of positive dimension"
                    .into(),
            ));
        }
        Ok(Self {
            vectors: vectors.to_dtype(DType::F32)?,
        })
    }

    /// Copy a corpus into memory, `chunk_docs` documents at a time.
    pub fn from_corpus(
        corpus: &dyn CorpusProvider,
        chunk_docs: usize,
    ) -> Result<Self> {
        let num_docs = corpus.num_docs();
        let mut parts = Vec::new();
        for range in chunk_ranges(num_docs, chunk_docs) {
            let expected = range.len();
            let part = corpus.vectors(range)?;
            let (n, t, d) = part.dims3()?;
            if n != expected {
                return Err(Error::ShapeMismatch {
                    expected,
                    actual: n,
                });
            }
            if t != corpus.tokens_per_doc() {
                return Err(Error::ShapeMismatch {
                    expected: corpus.tokens_per_doc(),
                    actual: t,
                });
            }
            if d != corpus.dimension() {
                return Err(Error::DimensionMismatch {
                    expected: corpus.dimension(),
                    actual: d,
                });
            }
            parts.push(part.to_dtype(DType::F32)?);
        }

        if parts.is_empty() {
            return Self::new(Tensor::zeros(
                (0, corpus.tokens_per_doc(), corpus.dimension()),
                DType::F32,
                &Device::Cpu,
            )?);
        }
        Self::new(Tensor::cat(&parts, 0)?)
    }

    /// Materialize another store in memory.
    ///
    /// Fails with [`Error::MemoryBudget`] before reading anything when the
    /// vectors would not fit in `budget_bytes`.
    pub fn load_from(
        store: &dyn VectorStore,
        max_chunk_rows: usize,
        budget_bytes: Option<u64>,
    ) -> Result<Self> {
        let required = (store.num_docs() as u64)
            * (store.tokens_per_doc() as u64)
            * (store.dimension() as u64)
            * std::mem::size_of::<f32>() as u64;

        if let Some(budget) = budget_bytes
            && required > budget
        {
            return Err(Error::MemoryBudget { required, budget });
        }

        info!(
            "Reading {} document vectors ({})",
            store.num_docs(),
            format_bytes(required)
        );

        let pids: Vec<i64> = (0..store.num_docs() as i64).collect();
        let vectors = store
            .get(&pids, max_chunk_rows)?
            .to_device(&default_device())?;
        log_tensor_size(&vectors, "Loaded document vectors");
        Self::new(vectors)
    }

    pub fn vectors(&self) -> &Tensor {
        &self.vectors
    }
}

impl VectorStore for InMemoryStore {
    fn num_docs(&self) -> usize {
        self.vectors.dim(0).unwrap_or(0)
    }

    fn tokens_per_doc(&self) -> usize {
        self.vectors.dim(1).unwrap_or(0)
    }

    fn dimension(&self) -> usize {
        self.vectors.dim(2).unwrap_or(0)
    }

    fn fetch(&self, pids: &[i64]) -> Result<Tensor> {
        let num_docs = self.num_docs() as i64;
        let ids = pids
            .iter()
            .map(|&pid| {
                if (0..num_docs).contains(&pid) {
                    Ok(pid as u32)
                } else {
                    Err(Error::UnknownDocument(pid))
                }
            })
            .collect::<Result<Vec<u32>>>()?;

        let ids = Tensor::from_vec(ids, pids.len(), self.vectors.device())?;
        Ok(self.vectors.index_select(&ids, 0)?)
    }
}

/// Gather the document matrices of a padded candidate grid.
///
/// `candidates` is `[Q, p]`; sentinel ids (`< 0`) get an all-zero matrix.
/// Every distinct document is read once. Returns `[Q, p, T, D]`.
pub fn gather_candidates(
    store: &dyn VectorStore,
    candidates: &[Vec<i64>],
    max_chunk_rows: usize,
) -> Result<Tensor> {
    let tokens = store.tokens_per_doc();
    let dimension = store.dimension();
    let num_queries = candidates.len();
    let width = candidates.first().map_or(0, Vec::len);

    if let Some(row) = candidates.iter().find(|row| row.len() != width) {
        return Err(Error::ShapeMismatch {
            expected: width,
            actual: row.len(),
        });
    }

    let unique: Vec<i64> = candidates
        .iter()
        .flatten()
        .copied()
        .filter(|&pid| pid >= 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let position: HashMap<i64, u32> = unique
        .iter()
        .enumerate()
        .map(|(i, &pid)| (pid, i as u32))
        .collect();

    // Row `unique.len()` of the lookup table is the zero matrix.
    let sentinel_row = unique.len() as u32;
    let zeros =
        Tensor::zeros((1, tokens, dimension), DType::F32, &Device::Cpu)?;
    let table = if unique.is_empty() {
        zeros
    } else {
        let fetched = store.get(&unique, max_chunk_rows)?;
        Tensor::cat(&[&fetched, &zeros.to_device(fetched.device())?], 0)?
    };

    let rows: Vec<u32> = candidates
        .iter()
        .flatten()
        .map(|pid| position.get(pid).copied().unwrap_or(sentinel_row))
        .collect();
    let rows = Tensor::from_vec(rows, num_queries * width, table.device())?;

    let gathered = table
        .index_select(&rows, 0)?
        .reshape((num_queries, width, tokens, dimension))?;

    debug!(
        unique = unique.len(),
        "gathered candidate vectors {:?} ({})",
        gathered.dims(),
        format_bytes(tensor_bytes(&gathered))
    );

    Ok(gathered)
}

/// Split `[0, total)` into consecutive ranges of at most `chunk` items.
pub fn chunk_ranges(
    total: usize,
    chunk: usize,
) -> impl Iterator<Item = std::ops::Range<usize>> {
    let chunk = chunk.max(1);
    (0..total)
        .step_by(chunk)
        .map(move |start| start..(start + chunk).min(total))
}

/// Size of a tensor's elements in bytes.
pub fn tensor_bytes(tensor: &Tensor) -> u64 {
    (tensor.elem_count() * tensor.dtype().size_in_bytes()) as u64
}

/// Human-readable size, in MB below one GB and in GB above.
pub fn format_bytes(bytes: u64) -> String {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    if mb > 1024.0 {
        format!("{:.3} GB", mb / 1024.0)
    } else {
        format!("{mb:.3} MB")
    }
}

pub fn log_tensor_size(tensor: &Tensor, msg: &str) {
    info!(
        "{msg} mem. size={}, shape={:?}, dtype={:?}",
        format_bytes(tensor_bytes(tensor)),
        tensor.dims(),
        tensor.dtype()
    );
}
