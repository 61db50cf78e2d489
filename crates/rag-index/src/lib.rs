//! rag-index - Dense and sparse indexes and the index manager
//!
//! [`IndexManager`] is the single writer to both indexes. It chunks a
//! document, embeds the chunks in one batched call and writes the dense and
//! sparse entries in parallel with bounded retry, honouring the
//! INSERT / OVERWRITE / UPSERT write modes.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rag_chunk::SlidingWindowChunker;
//! use rag_core::{Document, SimilarityMetric, WriteMode};
//! use rag_embed::HashingEmbedder;
//! use rag_index::{DenseIndex, IndexManager, SparseIndex};
//! use rag_store::{MemoryDocumentStore, MemoryVectorStore};
//!
//! # async fn run() -> rag_core::Result<()> {
//! let dense = Arc::new(DenseIndex::new(Arc::new(MemoryVectorStore::new()), SimilarityMetric::Cosine));
//! let sparse = Arc::new(SparseIndex::new(Arc::new(MemoryDocumentStore::new())));
//! let manager = IndexManager::new(
//!     SlidingWindowChunker::new(20, 5)?,
//!     dense,
//!     sparse,
//!     Arc::new(HashingEmbedder::new()),
//! );
//!
//! let doc = Document::new("doc1", "the quick brown fox jumps over the lazy dog");
//! let report = manager.ingest("kb", &doc, WriteMode::Insert).await?;
//! assert_eq!(report.chunk_ids.len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod dense;
pub mod manager;
pub mod retry;
pub mod segment;
pub mod sparse;

pub use dense::DenseIndex;
pub use manager::{
    CollectionStats, ConsistencyReport, DeleteReport, Inconsistency, InconsistentDocument,
    IndexManager, IngestReport,
};
pub use retry::{RetryPolicy, Target};
pub use segment::segment;
pub use sparse::{Bm25Params, SegmentTokenizer, SparseIndex};
