//! rag-store - Vector and document store backends
//!
//! This crate provides the persistent SQLite backends and the in-memory
//! backends behind the [`VectorStore`](rag_core::VectorStore) and
//! [`DocumentStore`](rag_core::DocumentStore) traits. The SQLite vector store
//! answers cosine queries through sqlite-vec and falls back to an exact scan;
//! results are ordered by descending similarity with ties broken by
//! ascending chunk id.

mod memory;
mod rank;
mod schema;
mod sqlite;

pub use memory::{MemoryDocumentStore, MemoryVectorStore};
pub use sqlite::{SqliteDocumentStore, SqliteOptions, SqliteVectorStore};

// Re-export schema for testing/migrations
pub use schema::{vec_schema, vec_table, DENSE_SCHEMA, SCHEMA_VERSION, SPARSE_SCHEMA};
