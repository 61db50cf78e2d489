//! rag-embed - Embedding providers
//!
//! This crate provides the [`EmbeddingProvider`] backends:
//!
//! - [`OnnxEmbedder`]: local ONNX Runtime inference with mean pooling over
//!   the attention mask and L2 normalization. Supports asymmetric
//!   retrieval with separate document and query prefixes.
//! - [`HashingEmbedder`]: deterministic feature hashing over lowercase
//!   words. Needs no model files, which makes it the provider of choice
//!   for tests.

mod hashing;
mod onnx;

pub use hashing::HashingEmbedder;
pub use onnx::OnnxEmbedder;

// Re-export the provider trait for convenience
pub use rag_core::EmbeddingProvider;
