//! rag-chunk - Sliding window chunking
//!
//! This crate splits documents into overlapping windows measured in
//! characters or tokenizer tokens. Chunk text is always a contiguous
//! substring of the document, and offsets are character positions so the
//! original text can be rebuilt with [`reassemble`].
//!
//! # Example
//!
//! ```rust
//! use rag_chunk::SlidingWindowChunker;
//! use rag_core::Document;
//!
//! let chunker = SlidingWindowChunker::new(20, 5).unwrap();
//! let doc = Document::new("doc1", "the quick brown fox jumps over the lazy dog");
//! let chunks = chunker.chunk(&doc).unwrap();
//! assert_eq!(chunks.len(), 3);
//! assert_eq!(chunks[1].start_offset, 15);
//! ```

mod window;

pub use window::{chunk_text, reassemble, SlidingWindowChunker, TextWindow, WindowUnit};
