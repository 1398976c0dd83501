use std::ops::Range;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Source of precomputed document token embeddings.
///
/// Document ids are dense: every id in `[0, num_docs)` exists and owns
/// exactly `tokens_per_doc` vectors of width `dimension`.
pub trait CorpusProvider {
    fn num_docs(&self) -> usize;
    fn tokens_per_doc(&self) -> usize;
    fn dimension(&self) -> usize;

    /// Token embeddings of the documents in `pids`, shaped `[n, T, D]`.
    fn vectors(&self, pids: Range<usize>) -> Result<Tensor>;

    /// Raw text of a document, when the provider keeps it.
    fn text(&self, _pid: usize) -> Option<String> {
        None
    }
}

/// A corpus held entirely in one `[N, T, D]` tensor.
#[derive(Debug, Clone)]
pub struct TensorCorpus {
    vectors: Tensor,
    texts: Vec<String>,
}

impl TensorCorpus {
    pub fn new(vectors: Tensor) -> Result<Self> {
        vectors.dims3()?;
        Ok(Self {
            vectors: vectors.to_dtype(DType::F32)?,
            texts: Vec::new(),
        })
    }

    /// Attach one text per document.
    pub fn with_texts(mut self, texts: Vec<String>) -> Result<Self> {
        if texts.len() != self.num_docs() {
            return Err(Error::ShapeMismatch {
                expected: self.num_docs(),
                actual: texts.len(),
            });
        }
        self.texts = texts;
        Ok(self)
    }
}

impl CorpusProvider for TensorCorpus {
    fn num_docs(&self) -> usize {
        self.vectors.dim(0).unwrap_or(0)
    }

    fn tokens_per_doc(&self) -> usize {
        self.vectors.dim(1).unwrap_or(0)
    }

    fn dimension(&self) -> usize {
        self.vectors.dim(2).unwrap_or(0)
    }

    fn vectors(&self, pids: Range<usize>) -> Result<Tensor> {
        if pids.end > self.num_docs() || pids.start > pids.end {
            return Err(Error::UnknownDocument(pids.end as i64 - 1));
        }
        Ok(self.vectors.narrow(0, pids.start, pids.end - pids.start)?)
    }

    fn text(&self, pid: usize) -> Option<String> {
        self.texts.get(pid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn corpus() -> TensorCorpus {
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let vectors = Tensor::from_vec(data, (3, 2, 4), &Device::Cpu).unwrap();
        TensorCorpus::new(vectors).unwrap()
    }

    #[test]
    fn shape_accessors() {
        let c = corpus();
        assert_eq!(c.num_docs(), 3);
        assert_eq!(c.tokens_per_doc(), 2);
        assert_eq!(c.dimension(), 4);
    }

    #[test]
    fn vectors_slice_in_order() {
        let c = corpus();
        let slice = c.vectors(1..3).unwrap();
        assert_eq!(slice.dims3().unwrap(), (2, 2, 4));
        let flat: Vec<f32> = slice.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat[0], 8.0);
        assert_eq!(flat[15], 23.0);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let c = corpus();
        assert!(matches!(c.vectors(2..4), Err(Error::UnknownDocument(3))));
    }

    #[test]
    fn texts_must_cover_every_document() {
        let err = corpus()
            .with_texts(vec!["only one".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                expected: 3,
                actual: 1
            }
        ));

        let c = corpus()
            .with_texts(vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        assert_eq!(c.text(1).as_deref(), Some("b"));
        assert_eq!(c.text(7), None);
    }
}
