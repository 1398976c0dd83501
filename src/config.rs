use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEPTH_ENV_VAR: &str = "OPENQA_INDEX_DEPTH";
pub const IN_MEMORY_ENV_VAR: &str = "OPENQA_INDEX_IN_MEMORY";

/// Largest number of document rows requested from a vector store in one
/// underlying fetch.
pub const DEFAULT_MAX_CHUNK_ROWS: usize = 10_000;

/// Largest number of query token vectors sent to the ANN engine at once.
pub const DEFAULT_MAX_QUERY_BATCH: usize = 1 << 10;

/// Similarity between a query token and a document token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    #[default]
    Dot,
    Cosine,
}

/// Hyperparameters of the inverted-file / product-quantization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IvfPqParams {
    /// Number of coarse k-means cells.
    pub nlist: usize,
    /// Number of cells scanned per query vector.
    pub nprobe: usize,
    /// Number of sub-vectors each residual is split into. Must divide the
    /// embedding dimension.
    pub subvectors: usize,
    /// Codewords per sub-quantizer (codes are stored as `u8`).
    pub codebook_size: usize,
    /// Lloyd iterations for every k-means run.
    pub iterations: usize,
    pub seed: u64,
}

impl Default for IvfPqParams {
    fn default() -> Self {
        Self {
            nlist: 256,
            nprobe: 16,
            subvectors: 16,
            codebook_size: 256,
            iterations: 20,
            seed: 42,
        }
    }
}

/// Which ANN engine indexes the token vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    /// Exhaustive inner-product search.
    #[default]
    Flat,
    IvfPq(IvfPqParams),
}

/// All tunables of a [`ColbertIndex`](crate::ColbertIndex).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub similarity: Similarity,
    pub engine: EngineConfig,
    /// Neighbors retrieved per query token. `None` derives it from `k`.
    pub search_depth: Option<usize>,
    pub max_chunk_rows: usize,
    pub max_query_batch: usize,
    /// Upper bound on distinct candidate documents scored per query.
    pub max_candidates: Option<usize>,
    /// Copy the whole vector table into memory on open.
    pub in_memory: bool,
    pub memory_budget_bytes: Option<u64>,
    /// Train the ANN engine on at most this many documents.
    pub train_sample_docs: Option<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            similarity: Similarity::Dot,
            engine: EngineConfig::Flat,
            search_depth: None,
            max_chunk_rows: DEFAULT_MAX_CHUNK_ROWS,
            max_query_batch: DEFAULT_MAX_QUERY_BATCH,
            max_candidates: None,
            in_memory: false,
            memory_budget_bytes: None,
            train_sample_docs: None,
        }
    }
}

impl IndexConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `OPENQA_INDEX_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(DEPTH_ENV_VAR) {
            let depth = value.trim().parse::<usize>().map_err(|_| {
                Error::Configuration(format!(
                    "{DEPTH_ENV_VAR} must be a positive integer, got '{value}'"
                ))
            })?;
            self.search_depth = Some(depth);
        }

        if let Some(value) = lookup(IN_MEMORY_ENV_VAR) {
            self.in_memory = match value.trim().to_ascii_lowercase().as_str()
            {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(Error::Configuration(format!(
                        "{IN_MEMORY_ENV_VAR} must be a boolean, got '{other}'"
                    )));
                }
            };
        }

        Ok(())
    }

    /// Number of nearest neighbors fetched per query token for a top-`k`
    /// search.
    ///
    /// Without an explicit depth this is `max(1, min(10, k / 2))`.
    ///
    /// # Examples
    ///
    /// ```
    /// use openqa_index::IndexConfig;
    ///
    /// let config = IndexConfig::default();
    /// assert_eq!(config.search_depth(1), 1);
    /// assert_eq!(config.search_depth(8), 4);
    /// assert_eq!(config.search_depth(100), 10);
    /// ```
    pub fn search_depth(&self, k: usize) -> usize {
        self.search_depth.unwrap_or((k / 2).clamp(1, 10))
    }

    /// Check the configuration against the embedding dimension of the
    /// corpus it will index.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(Error::Configuration(
                "embedding dimension must be positive".into(),
            ));
        }
        if self.search_depth == Some(0) {
            return Err(Error::Configuration(
                "search_depth must be at least 1".into(),
            ));
        }
        if self.max_chunk_rows == 0 {
            return Err(Error::Configuration(
                "max_chunk_rows must be at least 1".into(),
            ));
        }
        if self.max_query_batch == 0 {
            return Err(Error::Configuration(
                "max_query_batch must be at least 1".into(),
            ));
        }
        if self.max_candidates == Some(0) {
            return Err(Error::Configuration(
                "max_candidates must be at least 1".into(),
            ));
        }
        if self.train_sample_docs == Some(0) {
            return Err(Error::Configuration(
                "train_sample_docs must be at least 1".into(),
            ));
        }

        if let EngineConfig::IvfPq(params) = &self.engine {
            params.validate(dimension)?;
        }

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

impl IvfPqParams {
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.nlist == 0 || self.nprobe == 0 {
            return Err(Error::Configuration(
                "nlist and nprobe must be at least 1".into(),
            ));
        }
        if self.subvectors == 0 || dimension % self.subvectors != 0 {
            return Err(Error::Configuration(format!(
                "dimension {dimension} is not divisible into {} sub-vectors",
                self.subvectors
            )));
        }
        if !(1..=256).contains(&self.codebook_size) {
            return Err(Error::Configuration(format!(
                "codebook_size must be within 1..=256, got {}",
                self.codebook_size
            )));
        }
        if self.iterations == 0 {
            return Err(Error::Configuration(
                "k-means needs at least one iteration".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(
        pairs: &[(&str, &str)],
    ) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn depth_heuristic_is_clamped() {
        let config = IndexConfig::default();
        assert_eq!(config.search_depth(0), 1);
        assert_eq!(config.search_depth(1), 1);
        assert_eq!(config.search_depth(3), 1);
        assert_eq!(config.search_depth(6), 3);
        assert_eq!(config.search_depth(20), 10);
        assert_eq!(config.search_depth(1000), 10);
    }

    #[test]
    fn explicit_depth_wins() {
        let config = IndexConfig {
            search_depth: Some(32),
            ..Default::default()
        };
        assert_eq!(config.search_depth(2), 32);
    }

    #[test]
    fn ivf_pq_rejects_indivisible_dimension() {
        let config = IndexConfig {
            engine: EngineConfig::IvfPq(IvfPqParams {
                subvectors: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(8),
            Err(Error::Configuration(_))
        ));
        assert!(config.validate(9).is_ok());
    }

    #[test]
    fn ivf_pq_rejects_oversized_codebook() {
        let params = IvfPqParams {
            codebook_size: 512,
            subvectors: 2,
            ..Default::default()
        };
        assert!(matches!(params.validate(4), Err(Error::Configuration(_))));
    }

    #[test]
    fn zero_depth_is_rejected() {
        let config = IndexConfig {
            search_depth: Some(0),
            ..Default::default()
        };
        assert!(config.validate(4).is_err());
    }

    #[test]
    fn overrides_are_applied() {
        let mut config = IndexConfig::default();
        config
            .apply_overrides(lookup_from(&[
                (DEPTH_ENV_VAR, "7"),
                (IN_MEMORY_ENV_VAR, "true"),
            ]))
            .unwrap();
        assert_eq!(config.search_depth, Some(7));
        assert!(config.in_memory);
    }

    #[test]
    fn bad_override_is_a_configuration_error() {
        let mut config = IndexConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[(IN_MEMORY_ENV_VAR, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn save_and_load_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.json");

        let config = IndexConfig {
            similarity: Similarity::Cosine,
            engine: EngineConfig::IvfPq(IvfPqParams {
                nlist: 4,
                subvectors: 2,
                ..Default::default()
            }),
            max_candidates: Some(64),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"kind\": \"ivf_pq\""));
        assert_eq!(IndexConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: IndexConfig =
            serde_json::from_str(r#"{"similarity": "cosine"}"#).unwrap();
        assert_eq!(config.similarity, Similarity::Cosine);
        assert_eq!(config.max_chunk_rows, DEFAULT_MAX_CHUNK_ROWS);
        assert_eq!(config.engine, EngineConfig::Flat);
    }
}
