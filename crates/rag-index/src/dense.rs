//! Dense vector index.

use std::sync::Arc;

use tracing::debug;

use rag_core::{
    Chunk, ChunkId, DenseEntry, IndexConfig, Result, ScoredChunk, SimilarityMetric, VectorStore,
};

/// Dense index over a vector store.
///
/// Embeddings are computed by the caller; the index only stores and ranks them.
pub struct DenseIndex {
    store: Arc<dyn VectorStore>,
    metric: SimilarityMetric,
}

impl DenseIndex {
    pub fn new(store: Arc<dyn VectorStore>, metric: SimilarityMetric) -> Self {
        Self { store, metric }
    }

    /// Create a dense index scoring with the configured metric.
    pub fn from_config(store: Arc<dyn VectorStore>, config: &IndexConfig) -> Self {
        Self::new(store, config.metric)
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    /// Build the entry for a chunk and its embedding.
    pub fn entry_for(chunk: &Chunk, embedding: Vec<f32>) -> DenseEntry {
        DenseEntry {
            chunk_id: chunk.id(),
            document_id: chunk.document_id.clone(),
            embedding,
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
        }
    }

    /// Insert or replace entries by chunk id.
    pub async fn upsert(&self, collection: &str, entries: &[DenseEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store.upsert(collection, entries).await?;
        debug!(collection, entries = entries.len(), "Dense upsert");
        Ok(())
    }

    /// Remove every entry of a document. Returns the number removed.
    pub async fn delete(&self, collection: &str, document_id: &str) -> Result<usize> {
        self.store
            .delete_prefix(collection, &ChunkId::document_prefix(document_id))
            .await
    }

    /// Chunk ids currently indexed for a document.
    pub async fn chunk_ids(&self, collection: &str, document_id: &str) -> Result<Vec<ChunkId>> {
        self.store
            .ids_with_prefix(collection, &ChunkId::document_prefix(document_id))
            .await
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        self.store.count(collection).await
    }

    /// Remove a collection and all its entries.
    pub async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.store.drop_collection(collection).await
    }

    /// The `top_n` most similar chunks, ties broken by ascending chunk id.
    pub async fn search(&self, collection: &str, query: &[f32], top_n: usize) -> Result<Vec<ScoredChunk>> {
        if top_n == 0 {
            return Ok(Vec::new());
        }
        let hits = match self.store.nearest(collection, query, top_n, self.metric).await {
            Ok(hits) => hits,
            Err(e) if e.is_collection_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        debug!(collection, hits = hits.len(), "Dense search");
        Ok(hits)
    }
}
