//! Sparse lexical index ranked with BM25.
//!
//! Scoring uses the [`bm25`](https://crates.io/crates/bm25) search engine,
//! built over the scanned collection with [`SegmentTokenizer`] so chunk text
//! and queries are split the same way, CJK runs included.

use std::sync::Arc;

use bm25::{Document, SearchEngineBuilder, Tokenizer};
use tracing::debug;

use rag_core::{Chunk, ChunkId, DocumentStore, IndexConfig, Result, ScoredChunk, SparseEntry};

use crate::segment::segment;

/// BM25 tuning passed to the search engine builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term frequency saturation.
    pub k1: f32,
    /// Document length normalization.
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

impl From<&IndexConfig> for Bm25Params {
    fn from(config: &IndexConfig) -> Self {
        Self {
            k1: config.bm25_k1,
            b: config.bm25_b,
        }
    }
}

/// Tokenizer handing [`segment`] to the `bm25` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentTokenizer;

impl Tokenizer for SegmentTokenizer {
    fn tokenize(&self, input_text: &str) -> Vec<String> {
        segment(input_text)
    }
}

/// Sparse index over a document store.
pub struct SparseIndex {
    store: Arc<dyn DocumentStore>,
    params: Bm25Params,
}

impl SparseIndex {
    /// Create a sparse index with default BM25 parameters.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_params(store, Bm25Params::default())
    }

    pub fn with_params(store: Arc<dyn DocumentStore>, params: Bm25Params) -> Self {
        Self { store, params }
    }

    /// Create a sparse index with the configured BM25 parameters.
    pub fn from_config(store: Arc<dyn DocumentStore>, config: &IndexConfig) -> Self {
        Self::with_params(store, Bm25Params::from(config))
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Build the entry for a chunk.
    pub fn entry_for(chunk: &Chunk) -> SparseEntry {
        SparseEntry {
            chunk_id: chunk.id(),
            document_id: chunk.document_id.clone(),
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
        }
    }

    /// Insert or replace entries by chunk id.
    pub async fn upsert(&self, collection: &str, entries: &[SparseEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store.upsert(collection, entries).await?;
        debug!(collection, entries = entries.len(), "Sparse upsert");
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

    /// Rank the collection against the query text.
    ///
    /// Chunks sharing no term with the query are not returned.
    pub async fn search(&self, collection: &str, query: &str, top_n: usize) -> Result<Vec<ScoredChunk>> {
        if top_n == 0 || segment(query).is_empty() {
            return Ok(Vec::new());
        }

        let entries = match self.store.scan(collection).await {
            Ok(entries) => entries,
            Err(e) if e.is_collection_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let hits = rank(entries, query, self.params, top_n);

        debug!(collection, hits = hits.len(), "Sparse search");
        Ok(hits)
    }
}

/// Score `entries` against `query` and keep the best `top_n`.
///
/// Ties are broken by ascending chunk id.
pub fn rank(entries: Vec<SparseEntry>, query: &str, params: Bm25Params, top_n: usize) -> Vec<ScoredChunk> {
    if entries.is_empty() {
        return Vec::new();
    }

    let documents: Vec<Document<usize>> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| Document {
            id: i,
            contents: entry.text.clone(),
        })
        .collect();
    let engine = SearchEngineBuilder::<usize, u32, SegmentTokenizer>::with_tokenizer_and_documents(
        SegmentTokenizer,
        documents,
    )
    .k1(params.k1)
    .b(params.b)
    .build();

    // Every match is needed before truncating, or the tie-break would depend
    // on the engine's internal order.
    let matches = engine.search(query, entries.len());

    let mut slots: Vec<Option<SparseEntry>> = entries.into_iter().map(Some).collect();
    let mut hits: Vec<ScoredChunk> = matches
        .into_iter()
        .filter(|m| m.score > 0.0)
        .filter_map(|m| {
            let entry = slots.get_mut(m.document.id)?.take()?;
            Some(ScoredChunk {
                chunk_id: entry.chunk_id,
                score: m.score,
                text: entry.text,
                metadata: entry.metadata,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_n);
    hits
}
