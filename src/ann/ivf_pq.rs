//! Inverted-file index with product-quantized residuals.
//!
//! A coarse k-means partitions token vectors into `nlist` cells. Each vector
//! is stored in its cell as `subvectors` one-byte codes quantizing the
//! residual against the cell centroid. A query scans the `nprobe` closest
//! cells and scores each entry as `q . centroid + sum_j q_j . codeword_j`,
//! using a per-query lookup table of sub-vector inner products.

use candle_core::Tensor;
use rayon::prelude::*;

use super::{
    AnnEngine, Neighbors, dot,
    kmeans::{Centroids, kmeans},
    matrix_rows, squared_l2, top_hits,
};
use crate::{
    config::IvfPqParams,
    error::{Error, Result},
};

#[derive(Default, Clone)]
struct InvertedList {
    ids: Vec<i64>,
    /// `subvectors` codes per entry, entry-major.
    codes: Vec<u8>,
}

struct Quantizers {
    coarse: Centroids,
    /// One codebook per sub-vector, each `dimension / subvectors` wide.
    codebooks: Vec<Centroids>,
}

pub struct IvfPqEngine {
    dimension: usize,
    params: IvfPqParams,
    quantizers: Option<Quantizers>,
    lists: Vec<InvertedList>,
    ntotal: usize,
}

impl IvfPqEngine {
    pub fn new(dimension: usize, params: IvfPqParams) -> Result<Self> {
        params.validate(dimension)?;
        Ok(Self {
            dimension,
            params,
            quantizers: None,
            lists: vec![InvertedList::default(); params.nlist],
            ntotal: 0,
        })
    }

    pub fn params(&self) -> &IvfPqParams {
        &self.params
    }

    fn sub_dimension(&self) -> usize {
        self.dimension / self.params.subvectors
    }
}

impl std::fmt::Debug for IvfPqEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvfPqEngine")
            .field("dimension", &self.dimension)
            .field("params", &self.params)
            .field("trained", &self.quantizers.is_some())
            .field("ntotal", &self.ntotal)
            .finish_non_exhaustive()
    }
}

/// Column block `j` of every row of a row-major matrix.
fn sub_block(data: &[f32], dimension: usize, dsub: usize, j: usize) -> Vec<f32> {
    data.chunks_exact(dimension)
        .flat_map(|row| &row[j * dsub..(j + 1) * dsub])
        .copied()
        .collect()
}

fn residual(v: &[f32], centroid: &[f32]) -> Vec<f32> {
    v.iter().zip(centroid).map(|(x, c)| x - c).collect()
}

impl AnnEngine for IvfPqEngine {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_trained(&self) -> bool {
        self.quantizers.is_some()
    }

    fn ntotal(&self) -> usize {
        self.ntotal
    }

    fn train(&mut self, vectors: &Tensor) -> Result<()> {
        let data = matrix_rows(vectors, self.dimension)?;
        let n = data.len() / self.dimension;
        let needed = self.params.nlist.max(self.params.codebook_size);
        if n < needed {
            return Err(Error::Configuration(format!(
                "IVF-PQ training needs at least {needed} vectors, got {n}"
            )));
        }

        let p = self.params;
        let coarse = kmeans(&data, self.dimension, p.nlist, p.iterations, p.seed);

        let residuals: Vec<f32> = data
            .par_chunks_exact(self.dimension)
            .flat_map_iter(|v| residual(v, coarse.get(coarse.nearest(v))))
            .collect();

        let dsub = self.sub_dimension();
        let codebooks = (0..p.subvectors)
            .into_par_iter()
            .map(|j| {
                let block = sub_block(&residuals, self.dimension, dsub, j);
                let seed = p.seed.wrapping_add(1 + j as u64);
                kmeans(&block, dsub, p.codebook_size, p.iterations, seed)
            })
            .collect();

        tracing::debug!(
            vectors = n,
            nlist = p.nlist,
            subvectors = p.subvectors,
            "trained IVF-PQ quantizers"
        );

        self.quantizers = Some(Quantizers { coarse, codebooks });
        self.lists = vec![InvertedList::default(); p.nlist];
        self.ntotal = 0;
        Ok(())
    }

    fn add(&mut self, vectors: &Tensor) -> Result<()> {
        let Some(q) = &self.quantizers else {
            return Err(Error::Configuration(
                "engine must be trained before vectors are added".into(),
            ));
        };
        let data = matrix_rows(vectors, self.dimension)?;
        let dsub = self.sub_dimension();

        let encoded: Vec<(usize, Vec<u8>)> = data
            .par_chunks_exact(self.dimension)
            .map(|v| {
                let cell = q.coarse.nearest(v);
                let r = residual(v, q.coarse.get(cell));
                let codes = q
                    .codebooks
                    .iter()
                    .zip(r.chunks_exact(dsub))
                    .map(|(book, sub)| book.nearest(sub) as u8)
                    .collect();
                (cell, codes)
            })
            .collect();

        for (cell, codes) in encoded {
            let list = &mut self.lists[cell];
            list.ids.push(self.ntotal as i64);
            list.codes.extend_from_slice(&codes);
            self.ntotal += 1;
        }
        Ok(())
    }

    fn search(&self, queries: &Tensor, depth: usize) -> Result<Neighbors> {
        let data = matrix_rows(queries, self.dimension)?;
        let rows = data.len() / self.dimension;
        let Some(q) = &self.quantizers else {
            return Ok(Neighbors::empty(rows, depth));
        };

        let m = self.params.subvectors;
        let ksub = self.params.codebook_size;
        let dsub = self.sub_dimension();
        let nprobe = self.params.nprobe.min(q.coarse.len());

        let hits = data
            .par_chunks_exact(self.dimension)
            .map(|query| {
                let mut cells: Vec<(f32, usize)> = q
                    .coarse
                    .iter()
                    .map(|c| squared_l2(query, c))
                    .zip(0..)
                    .collect();
                cells.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

                // lut[j * ksub + c] = q_j . codeword_c of sub-quantizer j
                let mut lut = vec![0.0f32; m * ksub];
                for (j, (book, sub)) in
                    q.codebooks.iter().zip(query.chunks_exact(dsub)).enumerate()
                {
                    for (c, word) in book.iter().enumerate() {
                        lut[j * ksub + c] = dot(sub, word);
                    }
                }

                let mut hits = Vec::new();
                for &(_, cell) in &cells[..nprobe] {
                    let base = dot(query, q.coarse.get(cell));
                    let list = &self.lists[cell];
                    for (id, codes) in
                        list.ids.iter().zip(list.codes.chunks_exact(m))
                    {
                        let score = base
                            + codes
                                .iter()
                                .enumerate()
                                .map(|(j, &c)| lut[j * ksub + c as usize])
                                .sum::<f32>();
                        hits.push((score, *id));
                    }
                }
                top_hits(hits, depth)
            })
            .collect();

        Ok(Neighbors::from_hits(depth, hits))
    }
}
