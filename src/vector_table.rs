use std::{ops::Range, path::Path};

use candle_core::{DType, Device, Tensor};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::{
    corpus::CorpusProvider,
    error::{Error, Result},
    vector_store::{VectorStore, chunk_ranges},
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const TOKEN_MAP: TableDefinition<&str, &[u8]> =
    TableDefinition::new("token_map");
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const TOKEN_MAP_KEY: &str = "emb2pid";
const NUM_DOCS_KEY: &str = "num_docs";
const TOKENS_PER_DOC_KEY: &str = "tokens_per_doc";
const DIMENSION_KEY: &str = "dimension";

/// Header size: 4 bytes token count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// On-disk table of document token embeddings, one row per document.
///
/// Binary format per row:
/// - 4 bytes: token count T (u32 LE)
/// - 4 bytes: embedding dimension D (u32 LE)
/// - T * D * 4 bytes: f32 LE values, token-major
///
/// Rows are keyed by document id and must cover `[0, num_docs)` without
/// gaps. The same database holds the serialized token-to-document map and
/// the shape metadata both are checked against on load.
pub struct VectorTable {
    db: Database,
    num_docs: usize,
    tokens_per_doc: usize,
    dimension: usize,
}

impl VectorTable {
    /// Open or create a vector table for documents of a fixed shape.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use openqa_index::{VectorStore, VectorTable};
    ///
    /// let table =
    ///     VectorTable::create(&tmp.path().join("vectors.redb"), 32, 128)
    ///         .unwrap();
    /// assert_eq!(table.num_docs(), 0);
    /// ```
    pub fn create(
        path: &Path,
        tokens_per_doc: usize,
        dimension: usize,
    ) -> Result<Self> {
        if tokens_per_doc == 0 || dimension == 0 {
            return Err(Error::Configuration(
                "documents need at least one token of positive dimension"
                    .into(),
            ));
        }

        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        let num_docs = {
            txn.open_table(VECTORS)?;
            txn.open_table(TOKEN_MAP)?;
            let mut meta = txn.open_table(METADATA)?;

            let stored = (
                meta.get(TOKENS_PER_DOC_KEY)?.map(|v| v.value()),
                meta.get(DIMENSION_KEY)?.map(|v| v.value()),
            );
            match stored {
                (Some(t), Some(d)) => {
                    if t as usize != tokens_per_doc || d as usize != dimension
                    {
                        return Err(Error::IndexCorruption(format!(
                            "table holds [{t}, {d}] documents, \
                             requested [{tokens_per_doc}, {dimension}]"
                        )));
                    }
                    meta.get(NUM_DOCS_KEY)?.map_or(0, |v| v.value()) as usize
                }
                _ => {
                    meta.insert(TOKENS_PER_DOC_KEY, tokens_per_doc as u64)?;
                    meta.insert(DIMENSION_KEY, dimension as u64)?;
                    meta.insert(NUM_DOCS_KEY, 0u64)?;
                    0
                }
            }
        };
        txn.commit()?;

        Ok(Self {
            db,
            num_docs,
            tokens_per_doc,
            dimension,
        })
    }

    /// Open an existing vector table, reading its shape from metadata.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::IndexCorruption(format!(
                "vector table {} does not exist",
                path.display()
            )));
        }
        let db = Database::open(path)?;

        let (num_docs, tokens_per_doc, dimension) = {
            let txn = db.begin_read()?;
            let meta = txn.open_table(METADATA).map_err(|e| {
                Error::IndexCorruption(format!("missing metadata table: {e}"))
            })?;
            let read = |key: &str| -> Result<usize> {
                meta.get(key)?.map(|v| v.value() as usize).ok_or_else(|| {
                    Error::IndexCorruption(format!("metadata lacks '{key}'"))
                })
            };
            (
                read(NUM_DOCS_KEY)?,
                read(TOKENS_PER_DOC_KEY)?,
                read(DIMENSION_KEY)?,
            )
        };

        debug!(num_docs, tokens_per_doc, dimension, "opened vector table");

        Ok(Self {
            db,
            num_docs,
            tokens_per_doc,
            dimension,
        })
    }

    /// Append documents shaped `[n, T, D]`, returning the ids they received.
    ///
    /// Any stored token map no longer covers the table and is dropped.
    pub fn append(&mut self, vectors: &Tensor) -> Result<Range<i64>> {
        let (n, t, d) = vectors.dims3()?;
        self.check_shape(t, d)?;

        let flat: Vec<f32> =
            vectors.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let row_len = t * d;
        let first = self.num_docs;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for (i, row) in flat.chunks_exact(row_len).enumerate() {
                write_row(&mut table, (first + i) as u64, t, d, row)?;
            }

            let mut meta = txn.open_table(METADATA)?;
            meta.insert(NUM_DOCS_KEY, (first + n) as u64)?;

            let mut map = txn.open_table(TOKEN_MAP)?;
            map.remove(TOKEN_MAP_KEY)?;
        }
        txn.commit()?;

        self.num_docs = first + n;
        Ok(first as i64..self.num_docs as i64)
    }

    /// Copy every document of a corpus into the table, `chunk_docs` at a
    /// time.
    pub fn import_corpus(
        &mut self,
        corpus: &dyn CorpusProvider,
        chunk_docs: usize,
    ) -> Result<usize> {
        self.check_shape(corpus.tokens_per_doc(), corpus.dimension())?;

        let mut imported = 0;
        for range in chunk_ranges(corpus.num_docs(), chunk_docs) {
            let expected = range.len();
            let vectors = corpus.vectors(range)?;
            let n = vectors.dim(0)?;
            if n != expected {
                return Err(Error::ShapeMismatch {
                    expected,
                    actual: n,
                });
            }
            self.append(&vectors)?;
            imported += n;
        }

        info!(imported, "Imported corpus vectors");
        Ok(imported)
    }

    /// Overwrite the matrix of an existing document.
    pub fn store(&self, pid: i64, data: &[f32]) -> Result<()> {
        self.check_pid(pid)?;
        let expected = self.tokens_per_doc * self.dimension;
        if data.len() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            write_row(
                &mut table,
                pid as u64,
                self.tokens_per_doc,
                self.dimension,
                data,
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Overwrite several documents in a single transaction.
    pub fn batch_store(&self, rows: &[(i64, &[f32])]) -> Result<()> {
        let expected = self.tokens_per_doc * self.dimension;
        for &(pid, data) in rows {
            self.check_pid(pid)?;
            if data.len() != expected {
                return Err(Error::ShapeMismatch {
                    expected,
                    actual: data.len(),
                });
            }
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for &(pid, data) in rows {
                write_row(
                    &mut table,
                    pid as u64,
                    self.tokens_per_doc,
                    self.dimension,
                    data,
                )?;
            }
        }
        txn.commit()?;
        debug!(rows = rows.len(), "Overwrote document vectors");
        Ok(())
    }

    /// Retrieve the flat matrix of one document.
    pub fn load(&self, pid: i64) -> Result<Option<Vec<f32>>> {
        Ok(self.batch_load(&[pid])?.pop().flatten())
    }

    /// Load several documents in a single transaction.
    ///
    /// Preserves input order; rows that are missing or fail to decode
    /// return None.
    pub fn batch_load(&self, pids: &[i64]) -> Result<Vec<Option<Vec<f32>>>> {
        if pids.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;

        let mut results = Vec::with_capacity(pids.len());
        for &pid in pids {
            let row = if pid < 0 {
                None
            } else {
                table.get(pid as u64)?.and_then(|guard| {
                    decode_row(guard.value(), self.tokens_per_doc, self.dimension)
                })
            };
            results.push(row);
        }

        Ok(results)
    }

    /// Persist the token-to-document map built over this table.
    pub fn write_token_map(&self, slots: &[i64]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TOKEN_MAP)?;
            let bytes: &[u8] = bytemuck::cast_slice(slots);
            table.insert(TOKEN_MAP_KEY, bytes)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn read_token_map(&self) -> Result<Option<Vec<i64>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TOKEN_MAP)?;

        let Some(guard) = table.get(TOKEN_MAP_KEY)? else {
            return Ok(None);
        };
        let bytes = guard.value();
        if bytes.len() % std::mem::size_of::<i64>() != 0 {
            return Err(Error::IndexCorruption(format!(
                "token map holds {} bytes, not a whole number of ids",
                bytes.len()
            )));
        }
        Ok(Some(bytemuck::pod_collect_to_vec(bytes)))
    }

    /// Check every row against the metadata: ids contiguous from zero and
    /// every matrix shaped `[T, D]`.
    pub fn verify(&self) -> Result<()> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;

        let mut expected_pid = 0u64;
        for entry in table.iter()? {
            let (key, value) = entry?;
            let pid = key.value();
            if pid != expected_pid {
                return Err(Error::IndexCorruption(format!(
                    "document ids have a gap: expected {expected_pid}, \
                     found {pid}"
                )));
            }
            if decode_row(value.value(), self.tokens_per_doc, self.dimension)
                .is_none()
            {
                return Err(Error::IndexCorruption(format!(
                    "document {pid} is not a [{}, {}] matrix",
                    self.tokens_per_doc, self.dimension
                )));
            }
            expected_pid += 1;
        }

        if expected_pid as usize != self.num_docs {
            return Err(Error::IndexCorruption(format!(
                "metadata records {} documents, table holds {expected_pid}",
                self.num_docs
            )));
        }
        Ok(())
    }

    fn check_shape(&self, tokens: usize, dimension: usize) -> Result<()> {
        if dimension != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: dimension,
            });
        }
        if tokens != self.tokens_per_doc {
            return Err(Error::ShapeMismatch {
                expected: self.tokens_per_doc,
                actual: tokens,
            });
        }
        Ok(())
    }

    fn check_pid(&self, pid: i64) -> Result<()> {
        if pid < 0 || pid as usize >= self.num_docs {
            return Err(Error::UnknownDocument(pid));
        }
        Ok(())
    }
}

impl VectorStore for VectorTable {
    fn num_docs(&self) -> usize {
        self.num_docs
    }

    fn tokens_per_doc(&self) -> usize {
        self.tokens_per_doc
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    /// Rows that are absent are skipped, so the caller sees fewer rows than
    /// requested.
    fn fetch(&self, pids: &[i64]) -> Result<Tensor> {
        for &pid in pids {
            self.check_pid(pid)?;
        }

        let rows = self.batch_load(pids)?;
        let mut data =
            Vec::with_capacity(pids.len() * self.tokens_per_doc * self.dimension);
        let mut found = 0;
        for row in rows.into_iter().flatten() {
            data.extend_from_slice(&row);
            found += 1;
        }

        Ok(Tensor::from_vec(
            data,
            (found, self.tokens_per_doc, self.dimension),
            &Device::Cpu,
        )?)
    }
}

impl std::fmt::Debug for VectorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorTable")
            .field("num_docs", &self.num_docs)
            .field("tokens_per_doc", &self.tokens_per_doc)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

fn write_row(
    table: &mut redb::Table<'_, u64, &'static [u8]>,
    pid: u64,
    tokens: usize,
    dimension: usize,
    data: &[f32],
) -> Result<()> {
    let byte_len = HEADER_SIZE + std::mem::size_of_val(data);
    let mut guard = table.insert_reserve(pid, byte_len)?;
    let dest = guard.as_mut();

    dest[0..4].copy_from_slice(&(tokens as u32).to_le_bytes());
    dest[4..8].copy_from_slice(&(dimension as u32).to_le_bytes());
    dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(data));
    Ok(())
}

/// Decode a row, returning None unless it is exactly `[tokens, dimension]`.
fn decode_row(bytes: &[u8], tokens: usize, dimension: usize) -> Option<Vec<f32>> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let t = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    let d = u32::from_le_bytes(bytes[4..8].try_into().ok()?) as usize;
    if t != tokens || d != dimension {
        return None;
    }
    if bytes.len() != HEADER_SIZE + t * d * std::mem::size_of::<f32>() {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]))
}
