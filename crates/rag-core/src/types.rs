//! Core domain types for the RAG engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{RagError, Result};

/// Scalar metadata value attached to documents and chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Null,
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// String-keyed scalar metadata. Ordered so serialized rows are stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A source document, identified by a caller-supplied id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Caller-supplied identifier.
    pub id: String,

    /// Raw text.
    pub text: String,

    /// User-provided metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    /// Create a document without metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Deterministic chunk identifier: `{document_id}:{chunk_index}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Build the id of chunk `index` of `document_id`.
    pub fn new(document_id: &str, index: u32) -> Self {
        Self(format!("{}:{}", document_id, index))
    }

    /// Prefix shared by every chunk id of a document.
    pub fn document_prefix(document_id: &str) -> String {
        format!("{}:", document_id)
    }

    /// Wrap an id read back from a store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The document part of the id.
    pub fn document_id(&self) -> &str {
        self.0.rsplit_once(':').map(|(doc, _)| doc).unwrap_or(&self.0)
    }

    /// The chunk index part of the id, if well formed.
    pub fn chunk_index(&self) -> Option<u32> {
        self.0.rsplit_once(':').and_then(|(_, idx)| idx.parse().ok())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous window of a document; the unit of indexing and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Parent document id.
    pub document_id: String,

    /// Index within the document (0-based).
    pub chunk_index: u32,

    /// Chunk text.
    pub text: String,

    /// Start character offset in the document (inclusive).
    pub start_offset: usize,

    /// End character offset in the document (exclusive).
    pub end_offset: usize,

    /// Document metadata plus positional fields.
    pub metadata: Metadata,
}

impl Chunk {
    /// Deterministic id of this chunk.
    pub fn id(&self) -> ChunkId {
        ChunkId::new(&self.document_id, self.chunk_index)
    }
}

/// Entry of the dense index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseEntry {
    pub chunk_id: ChunkId,
    pub document_id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

/// Entry of the sparse (lexical) index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseEntry {
    pub chunk_id: ChunkId,
    pub document_id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// A search hit from either index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: ChunkId,

    /// Relevance score (higher is better).
    pub score: f32,

    pub text: String,
    pub metadata: Metadata,
}

/// A chunk in the final ranking returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChunk {
    pub chunk_id: ChunkId,

    /// Final score (fused in hybrid mode, raw otherwise).
    pub score: f32,

    pub text: String,

    /// None when only page content was requested.
    pub metadata: Option<Metadata>,

    /// Dense score, min-max normalized in hybrid mode. None if not a dense candidate.
    pub dense_score: Option<f32>,

    /// Sparse score, min-max normalized in hybrid mode. None if not a sparse candidate.
    pub sparse_score: Option<f32>,
}

/// How an ingestion call treats existing entries of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Fail if any chunk of the document already exists.
    Insert,
    /// Remove every entry of the document before writing.
    Overwrite,
    /// Replace matching chunk ids, add new ones, keep the rest.
    #[default]
    Upsert,
}

/// Which indexes a query consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Hybrid,
    Dense,
    Bm25,
}

/// Similarity used by the dense index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    InnerProduct,
}

impl SimilarityMetric {
    /// Score two vectors; higher is more similar.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        match self {
            Self::InnerProduct => dot,
            Self::Cosine => {
                let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot / (na * nb)
                }
            }
        }
    }
}

/// The two heterogeneous stores behind the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Dense,
    Sparse,
}

impl StoreKind {
    /// The other store.
    pub fn other(&self) -> Self {
        match self {
            Self::Dense => Self::Sparse,
            Self::Sparse => Self::Dense,
        }
    }
}

/// Relative weight of each index in hybrid fusion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub dense: f32,
    pub sparse: f32,
}

impl FusionWeights {
    pub fn new(dense: f32, sparse: f32) -> Self {
        Self { dense, sparse }
    }

    /// Weights must be finite, non-negative and sum to a positive value.
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [("dense", self.dense), ("sparse", self.sparse)] {
            if !w.is_finite() || w < 0.0 {
                return Err(RagError::invalid_config(format!(
                    "{} weight must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        if self.dense + self.sparse <= 0.0 {
            return Err(RagError::invalid_config("fusion weights must sum to a positive value"));
        }
        Ok(())
    }

    /// Weight of the given index.
    pub fn weight(&self, kind: StoreKind) -> f32 {
        match kind {
            StoreKind::Dense => self.dense,
            StoreKind::Sparse => self.sparse,
        }
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            dense: 0.5,
            sparse: 0.5,
        }
    }
}

macro_rules! display_and_parse {
    ($ty:ty, $what:literal, { $($variant:path => $name:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $($variant => $name,)+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $ty {
            type Err = RagError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    other => Err(RagError::invalid_config(format!(
                        concat!("unknown ", $what, ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

display_and_parse!(WriteMode, "write mode", {
    WriteMode::Insert => "insert",
    WriteMode::Overwrite => "overwrite",
    WriteMode::Upsert => "upsert",
});

display_and_parse!(RetrievalMode, "retrieval mode", {
    RetrievalMode::Hybrid => "hybrid",
    RetrievalMode::Dense => "dense",
    RetrievalMode::Bm25 => "bm25",
});

display_and_parse!(SimilarityMetric, "similarity metric", {
    SimilarityMetric::Cosine => "cosine",
    SimilarityMetric::InnerProduct => "inner_product",
});

display_and_parse!(StoreKind, "store kind", {
    StoreKind::Dense => "dense",
    StoreKind::Sparse => "sparse",
});
