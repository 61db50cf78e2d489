//! Core traits defining the interfaces to external collaborators.

use async_trait::async_trait;

use crate::error::{RagError, Result};
use crate::types::{ChunkId, DenseEntry, ScoredChunk, SimilarityMetric, SparseEntry};

/// Embedding model trait.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per text, in input order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    ///
    /// Models trained for asymmetric retrieval override this to apply a query prefix.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::provider("No embedding returned for query"))
    }

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;
}

/// Text completion trait.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Persistent store of chunk embeddings.
///
/// Collections are created on first upsert. Reads on a collection that was
/// never written return `CollectionNotFound` unless stated otherwise.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace entries by chunk id.
    async fn upsert(&self, collection: &str, entries: &[DenseEntry]) -> Result<()>;

    /// Remove every entry whose chunk id starts with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize>;

    /// Chunk ids starting with `prefix`, ascending. Empty for an unknown collection.
    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>>;

    /// The `top_n` most similar entries, best first.
    async fn nearest(
        &self,
        collection: &str,
        query: &[f32],
        top_n: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<ScoredChunk>>;

    /// Number of entries in a collection (0 when unknown).
    async fn count(&self, collection: &str) -> Result<usize>;

    /// Remove a collection and all its entries.
    async fn drop_collection(&self, collection: &str) -> Result<()>;
}

/// Persistent store of chunk text and lexical statistics.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace entries by chunk id.
    async fn upsert(&self, collection: &str, entries: &[SparseEntry]) -> Result<()>;

    /// Remove every entry whose chunk id starts with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize>;

    /// Chunk ids starting with `prefix`, ascending. Empty for an unknown collection.
    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>>;

    /// Every entry of a collection, ordered by chunk id. Empty for an unknown collection.
    async fn scan(&self, collection: &str) -> Result<Vec<SparseEntry>>;

    /// Number of entries in a collection (0 when unknown).
    async fn count(&self, collection: &str) -> Result<usize>;

    /// Remove a collection and all its entries.
    async fn drop_collection(&self, collection: &str) -> Result<()>;
}
