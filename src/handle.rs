use std::sync::{Arc, PoisonError, RwLock};

use candle_core::Tensor;
use tracing::info;

use crate::{
    colbert_index::ColbertIndex,
    config::IndexConfig,
    error::Result,
    search_result::SearchResult,
    vector_store::VectorStore,
};

/// Live reference to a frozen [`ColbertIndex`].
///
/// Readers take a snapshot with [`current`](Self::current) and keep
/// searching it while a replacement is built. Installing the replacement
/// only swaps the pointer; the old index is dropped once its last reader
/// is done with it.
#[derive(Debug)]
pub struct IndexHandle {
    live: RwLock<Arc<ColbertIndex>>,
}

impl IndexHandle {
    pub fn new(index: ColbertIndex) -> Self {
        Self {
            live: RwLock::new(Arc::new(index)),
        }
    }

    /// The index currently serving searches.
    pub fn current(&self) -> Arc<ColbertIndex> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `index`, returning the one it replaces.
    pub fn swap(&self, index: ColbertIndex) -> Arc<ColbertIndex> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *live, Arc::new(index))
    }

    /// Build a new index over `store` and swap it in. On error the live
    /// index is left untouched.
    pub fn rebuild(
        &self,
        store: Arc<dyn VectorStore>,
        config: IndexConfig,
    ) -> Result<Arc<ColbertIndex>> {
        let fresh = ColbertIndex::build(store, config)?;
        let documents = fresh.num_docs();
        let previous = self.swap(fresh);
        info!(
            documents,
            previous = previous.num_docs(),
            "Swapped in rebuilt index"
        );
        Ok(previous)
    }

    pub fn search_embeddings(
        &self,
        queries: &Tensor,
        k: usize,
    ) -> Result<SearchResult> {
        self.current().search_embeddings(queries, k)
    }
}
