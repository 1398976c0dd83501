//! openqa-index - a multi-vector (ColBERT late-interaction) retrieval index.
//!
//! Every token embedding of every document is indexed in a nearest-neighbor
//! engine. A query's token embeddings retrieve token-level hits, the hits
//! collapse to candidate documents, and the candidates are re-ranked with
//! MaxSim over their full token matrices. Results are fixed-width: each
//! query gets exactly `k` entries, padded with `(-1, -inf)`.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use candle_core::{Device, Tensor};
//! use openqa_index::{ColbertIndex, InMemoryStore, IndexConfig};
//!
//! // 3 documents of 2 tokens in 4 dimensions.
//! let docs = Tensor::from_vec(
//!     vec![
//!         1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, //
//!         0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, //
//!         0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5,
//!     ],
//!     (3, 2, 4),
//!     &Device::Cpu,
//! )
//! .unwrap();
//! let store = Arc::new(InMemoryStore::new(docs).unwrap());
//! let index = ColbertIndex::build(store, IndexConfig::default()).unwrap();
//!
//! let query =
//!     Tensor::from_vec(vec![0.0f32, 0.0, 1.0, 0.0], (1, 1, 4), &Device::Cpu)
//!         .unwrap();
//! let result = index.search_embeddings(&query, 2).unwrap();
//! assert_eq!(result.row(0).0[0], 1);
//! ```

pub mod ann;
pub mod candidates;
pub mod colbert_index;
pub mod config;
pub mod corpus;
pub mod encoder;
pub mod error;
pub mod handle;
pub mod index_dir;
pub mod maxsim;
pub mod search_result;
pub mod token_map;
pub mod vector_store;
pub mod vector_table;

pub use ann::{AnnEngine, FlatEngine, IvfPqEngine, Neighbors};
pub use candidates::{CandidateAggregator, CandidateSet};
pub use colbert_index::ColbertIndex;
pub use config::{EngineConfig, IndexConfig, IvfPqParams, Similarity};
pub use corpus::{CorpusProvider, TensorCorpus};
pub use encoder::{PrecomputedEncoder, QueryEncoder};
pub use error::{Error, Result};
pub use handle::IndexHandle;
pub use index_dir::IndexDir;
pub use maxsim::MaxSimScorer;
pub use search_result::SearchResult;
pub use token_map::TokenDocumentMap;
pub use vector_store::{InMemoryStore, VectorStore};
pub use vector_table::VectorTable;
