//! Question/answer knowledge base.
//!
//! Each entry is an error description indexed as a single unsplit chunk, with
//! its solution and tags carried as metadata. Lookup returns the best match
//! for a new description.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use rag_chunk::SlidingWindowChunker;
use rag_core::{Document, Metadata, MetadataValue, RagError, RankedChunk, Result, WriteMode};
use rag_index::{IndexManager, IngestReport};

use crate::retriever::{HybridRetriever, RetrieveRequest};

/// Collection used when none is configured.
pub const QA_COLLECTION: &str = "qa";

const SOLUTION_KEY: &str = "solution";
const TAGS_KEY: &str = "tags";

/// A stored error description and its solution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QaEntry {
    pub error_desc: String,
    pub solution: String,
    pub tags: Vec<String>,
    pub score: f32,
}

/// Error/solution pairs over the hybrid indexes.
pub struct QaKnowledge {
    manager: Arc<IndexManager>,
    retriever: Arc<HybridRetriever>,
    collection: String,
    mode: WriteMode,
}

impl QaKnowledge {
    pub fn new(manager: Arc<IndexManager>, retriever: Arc<HybridRetriever>) -> Self {
        Self {
            manager,
            retriever,
            collection: QA_COLLECTION.to_string(),
            mode: WriteMode::Upsert,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Stable document id derived from the description text.
    pub fn document_id(error_desc: &str) -> String {
        blake3::hash(error_desc.as_bytes()).to_hex()[..32].to_string()
    }

    /// Index an error description with its solution and tags.
    #[instrument(skip_all, fields(collection = %self.collection))]
    pub async fn index(&self, error_desc: &str, solution: &str, tags: &[&str]) -> Result<IngestReport> {
        if error_desc.trim().is_empty() {
            return Err(RagError::invalid_config("error description must not be empty"));
        }

        let document = Document::new(Self::document_id(error_desc), error_desc)
            .with_metadata(SOLUTION_KEY, solution)
            .with_metadata(TAGS_KEY, serde_json::to_string(tags)?);

        // Twice the description so the whole text lands in one chunk
        let chunk_size = (error_desc.chars().count() * 2).max(1);
        let chunker = SlidingWindowChunker::new(chunk_size, 0)?;

        let report = self
            .manager
            .ingest_with_chunker(&self.collection, &document, self.mode, &chunker)
            .await?;
        debug!(document_id = %report.document_id, "Indexed QA entry");
        Ok(report)
    }

    /// The stored entry closest to the description, if any.
    #[instrument(skip_all, fields(collection = %self.collection))]
    pub async fn retrieve(&self, error_desc: &str) -> Result<Option<QaEntry>> {
        let request = RetrieveRequest::new(self.collection.clone(), error_desc).with_top_k(1);
        let response = self.retriever.retrieve(&request).await?;
        response.chunks.into_iter().next().map(entry_from).transpose()
    }
}

fn entry_from(chunk: RankedChunk) -> Result<QaEntry> {
    let metadata = chunk.metadata.unwrap_or_default();
    Ok(QaEntry {
        solution: string_field(&metadata, SOLUTION_KEY)?,
        tags: serde_json::from_str(&string_field(&metadata, TAGS_KEY)?)?,
        error_desc: chunk.text,
        score: chunk.score,
    })
}

fn string_field(metadata: &Metadata, key: &str) -> Result<String> {
    match metadata.get(key) {
        Some(MetadataValue::String(value)) => Ok(value.clone()),
        _ => Err(RagError::internal(format!("QA entry is missing '{}'", key))),
    }
}
