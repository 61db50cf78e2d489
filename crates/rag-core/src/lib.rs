//! rag-core - Core types and traits for the hybrid RAG engine
//!
//! This crate provides the domain types, collaborator traits, configuration
//! and error handling shared by the chunking, storage, embedding, indexing
//! and query crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{RagError, Result};
pub use traits::*;
pub use types::*;
