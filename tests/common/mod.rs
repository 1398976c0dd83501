#![allow(dead_code)]

use std::sync::{Arc, Once};

use candle_core::{Device, Tensor};
use openqa_index::{InMemoryStore, VectorStore};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route library logs to the test output, filtered by `OPENQA_INDEX_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = std::env::var("OPENQA_INDEX_LOG")
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init();
    });
}

pub fn tensor(data: &[f32], shape: &[usize]) -> Tensor {
    Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
}

pub fn memory_store(
    data: &[f32],
    docs: usize,
    tokens: usize,
    dim: usize,
) -> Arc<dyn VectorStore> {
    let vectors = tensor(data, &[docs, tokens, dim]);
    Arc::new(InMemoryStore::new(vectors).unwrap())
}

/// Seeded uniform values in `[-1, 1)`.
pub fn noise(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect()
}
