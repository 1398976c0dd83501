use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
pub fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Turns query text into token embeddings.
///
/// Implementations return `[N, T, D]` for `N` queries. Queries shorter
/// than `T` are padded with all-zero token vectors, which the index never
/// searches or scores.
pub trait QueryEncoder {
    fn dimension(&self) -> usize;

    fn encode_queries(&mut self, queries: &[String]) -> Result<Tensor>;
}

/// Encoder backed by token embeddings computed ahead of time.
pub struct PrecomputedEncoder {
    dimension: usize,
    device: Device,
    embeddings: HashMap<String, Tensor>,
}

impl PrecomputedEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            device: default_device(),
            embeddings: HashMap::new(),
        }
    }

    /// Register the `[T, D]` token embeddings of a query text.
    pub fn insert(&mut self, text: impl Into<String>, tokens: Tensor) -> Result<()> {
        let (_, d) = tokens.dims2()?;
        if d != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: d,
            });
        }
        let tokens = tokens.to_device(&self.device)?.to_dtype(DType::F32)?;
        self.embeddings.insert(text.into(), tokens);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

impl std::fmt::Debug for PrecomputedEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecomputedEncoder")
            .field("dimension", &self.dimension)
            .field("queries", &self.embeddings.len())
            .finish_non_exhaustive()
    }
}

impl QueryEncoder for PrecomputedEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_queries(&mut self, queries: &[String]) -> Result<Tensor> {
        let tokens = queries
            .iter()
            .map(|text| {
                self.embeddings
                    .get(text)
                    .ok_or_else(|| Error::UnknownQuery(text.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let longest = tokens
            .iter()
            .map(|t| t.dim(0))
            .collect::<candle_core::Result<Vec<_>>>()?
            .into_iter()
            .max()
            .unwrap_or(0);

        let padded = tokens
            .into_iter()
            .map(|t| Ok(t.pad_with_zeros(0, 0, longest - t.dim(0)?)?))
            .collect::<Result<Vec<_>>>()?;

        if padded.is_empty() {
            return Ok(Tensor::zeros(
                (0, 0, self.dimension),
                DType::F32,
                &self.device,
            )?);
        }
        Ok(Tensor::stack(&padded, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(data: &[f32], rows: usize) -> Tensor {
        Tensor::from_vec(data.to_vec(), (rows, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn pads_to_longest_query() {
        let mut encoder = PrecomputedEncoder::new(2);
        encoder.insert("short", tokens(&[1.0, 0.0], 1)).unwrap();
        encoder
            .insert("long", tokens(&[0.0, 1.0, 1.0, 1.0, 2.0, 0.0], 3))
            .unwrap();

        let out = encoder
            .encode_queries(&["short".to_string(), "long".to_string()])
            .unwrap();
        assert_eq!(out.dims(), &[2, 3, 2]);
        let rows: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        assert_eq!(rows[0], vec![vec![1.0, 0.0], vec![0.0, 0.0], vec![0.0, 0.0]]);
        assert_eq!(rows[1][2], vec![2.0, 0.0]);
    }

    #[test]
    fn unknown_query_is_an_error() {
        let mut encoder = PrecomputedEncoder::new(2);
        let err = encoder.encode_queries(&["missing".to_string()]).unwrap_err();
        assert!(matches!(err, Error::UnknownQuery(q) if q == "missing"));
    }

    #[test]
    fn insert_checks_dimension() {
        let mut encoder = PrecomputedEncoder::new(3);
        let err = encoder.insert("q", tokens(&[1.0, 0.0], 1)).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(encoder.is_empty());
    }
}
