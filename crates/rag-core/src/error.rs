//! Error types for the RAG engine.

use thiserror::Error;

use crate::types::StoreKind;

/// Result type alias using RagError.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur while indexing or retrieving.
#[derive(Error, Debug)]
pub enum RagError {
    /// Bad chunking, weight or request values. Rejected before any I/O.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// INSERT found chunk ids already indexed for the document.
    #[error("Document '{document_id}' already indexed in '{collection}' ({existing} chunks)")]
    DuplicateDocument {
        collection: String,
        document_id: String,
        existing: usize,
    },

    /// One of the two indexes is behind the other after retries.
    #[error(
        "Partial index failure for '{document_id}' in '{collection}': {diverged} index diverged ({} chunks affected): {source}",
        .chunk_ids.len()
    )]
    PartialIndexFailure {
        collection: String,
        document_id: String,
        diverged: StoreKind,
        chunk_ids: Vec<String>,
        #[source]
        source: Box<RagError>,
    },

    /// OVERWRITE removed the previous entries and neither index accepted the
    /// new ones. Both indexes agree, but the document is gone from both.
    #[error(
        "Overwrite of '{document_id}' in '{collection}' lost the document: {removed} entries removed, {} chunks not written to either index: {source}; {other}",
        .chunk_ids.len()
    )]
    OverwriteLost {
        collection: String,
        document_id: String,
        removed: usize,
        chunk_ids: Vec<String>,
        /// Dense upsert failure.
        #[source]
        source: Box<RagError>,
        /// Sparse upsert failure.
        other: Box<RagError>,
    },

    /// A backing store could not be reached or timed out.
    #[error("{store} store unavailable: {message}")]
    StoreUnavailable { store: StoreKind, message: String },

    /// The embedding or language model provider failed.
    #[error("Provider error: {message}")]
    ProviderError { message: String },

    /// Collection not found.
    #[error("Collection not found: {name}")]
    CollectionNotFound { name: String },

    /// Embedding length does not match the collection.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RagError {
    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a store unavailable error.
    pub fn store(store: StoreKind, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            store,
            message: message.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderError {
            message: message.into(),
        }
    }

    /// Create a collection not found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::ProviderError { .. })
    }

    /// Whether this error means the collection does not exist.
    pub fn is_collection_not_found(&self) -> bool {
        matches!(self, Self::CollectionNotFound { .. })
    }

    /// Stable error code for callers that map errors onto a wire format.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::DuplicateDocument { .. } => "DUPLICATE_DOCUMENT",
            Self::PartialIndexFailure { .. } => "PARTIAL_INDEX_FAILURE",
            Self::OverwriteLost { .. } => "OVERWRITE_LOST",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::ProviderError { .. } => "PROVIDER_ERROR",
            Self::CollectionNotFound { .. } => "COLLECTION_NOT_FOUND",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
