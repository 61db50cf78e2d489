//! rag-query - Hybrid retrieval and answer generation
//!
//! This crate ranks indexed chunks against a query in one of three modes:
//!
//! - **dense**: embedding similarity only
//! - **bm25**: lexical BM25 only
//! - **hybrid**: both indexes queried concurrently, each result list min-max
//!   normalized and combined with configurable weights
//!
//! A hybrid query whose dense or sparse side fails still answers from the
//! other side and reports which index was left out.
//!
//! [`QaKnowledge`] builds an error/solution lookup on top of the same
//! indexes.
//!
//! # Example
//!
//! ```rust,ignore
//! use rag_query::{HybridRetriever, RetrieveRequest};
//!
//! let retriever = HybridRetriever::new(dense, sparse, embedder);
//! let request = RetrieveRequest::new("kb", "quick fox").with_top_k(5);
//! let response = retriever.retrieve(&request).await?;
//! for text in response.texts() {
//!     println!("{}", text);
//! }
//! ```

mod answer;
mod fusion;
mod qa;
mod retriever;

pub use answer::{render_prompt, Answer, AnswerEngine};
pub use fusion::{fuse, normalize};
pub use qa::{QaEntry, QaKnowledge, QA_COLLECTION};
pub use retriever::{HybridRetriever, RetrieveRequest, RetrieveResponse};

// Re-export for convenience
pub use rag_core::{RankedChunk, RetrievalMode};
