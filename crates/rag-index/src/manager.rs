//! Index manager: the only writer to the dense and sparse indexes.
//!
//! The two stores cannot share a transaction, so every write goes to both in
//! parallel with bounded retry. If exactly one side fails the call returns
//! `PartialIndexFailure` naming the side that is behind. If an OVERWRITE has
//! already removed the old entries and both writes fail, it returns
//! `OverwriteLost`. Either way the document is remembered as inconsistent
//! until a later ingest or delete succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use rag_chunk::SlidingWindowChunker;
use rag_core::{
    Chunk, ChunkId, Document, EmbeddingProvider, RagConfig, RagError, Result, StoreKind,
    WriteMode,
};

use crate::dense::DenseIndex;
use crate::retry::{RetryPolicy, Target};
use crate::sparse::SparseIndex;

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub collection: String,
    pub document_id: String,
    pub mode: WriteMode,
    /// Ids written, in chunk order.
    pub chunk_ids: Vec<ChunkId>,
    /// Entries removed before writing (OVERWRITE only), counted per chunk.
    pub removed: usize,
    pub latency_ms: u64,
}

/// Outcome of a document deletion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub collection: String,
    pub document_id: String,
    pub dense_removed: usize,
    pub sparse_removed: usize,
}

/// Comparison of a document's chunk ids across both indexes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub collection: String,
    pub document_id: String,
    /// Present in the sparse index only.
    pub missing_dense: Vec<ChunkId>,
    /// Present in the dense index only.
    pub missing_sparse: Vec<ChunkId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_dense.is_empty() && self.missing_sparse.is_empty()
    }
}

/// Entry counts of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub dense_entries: usize,
    pub sparse_entries: usize,
}

/// Why a document is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Inconsistency {
    /// This index is behind the other.
    Behind(StoreKind),
    /// An OVERWRITE removed the document and neither index took the new entries.
    Lost,
}

/// A document left flagged by a failed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InconsistentDocument {
    pub collection: String,
    pub document_id: String,
    pub issue: Inconsistency,
}

/// Index manager.
pub struct IndexManager {
    chunker: SlidingWindowChunker,
    dense: Arc<DenseIndex>,
    sparse: Arc<SparseIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    default_mode: WriteMode,
    inconsistent: Mutex<BTreeMap<(String, String), Inconsistency>>,
}

impl IndexManager {
    /// Create a manager with the default retry policy and UPSERT as default mode.
    pub fn new(
        chunker: SlidingWindowChunker,
        dense: Arc<DenseIndex>,
        sparse: Arc<SparseIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            chunker,
            dense,
            sparse,
            embedder,
            retry: RetryPolicy::default(),
            default_mode: WriteMode::Upsert,
            inconsistent: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create a manager from configuration.
    pub fn from_config(
        config: &RagConfig,
        dense: Arc<DenseIndex>,
        sparse: Arc<SparseIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = SlidingWindowChunker::from_config(&config.chunking)?;
        Ok(Self::new(chunker, dense, sparse, embedder)
            .with_retry(RetryPolicy::from(&config.retry))
            .with_default_mode(config.index.write_mode))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_mode(mut self, mode: WriteMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn chunker(&self) -> &SlidingWindowChunker {
        &self.chunker
    }

    pub fn default_mode(&self) -> WriteMode {
        self.default_mode
    }

    /// Ingest using the configured default write mode.
    pub async fn ingest_default(&self, collection: &str, document: &Document) -> Result<IngestReport> {
        self.ingest(collection, document, self.default_mode).await
    }

    /// Chunk, embed and write a document to both indexes.
    pub async fn ingest(
        &self,
        collection: &str,
        document: &Document,
        mode: WriteMode,
    ) -> Result<IngestReport> {
        self.ingest_with_chunker(collection, document, mode, &self.chunker)
            .await
    }

    /// Ingest with a chunker other than the configured one.
    #[instrument(skip_all, fields(collection = %collection, document_id = %document.id, mode = %mode))]
    pub async fn ingest_with_chunker(
        &self,
        collection: &str,
        document: &Document,
        mode: WriteMode,
        chunker: &SlidingWindowChunker,
    ) -> Result<IngestReport> {
        let start = Instant::now();
        validate_collection(collection)?;
        validate_document_id(&document.id)?;

        let chunks = chunker.chunk(document)?;
        let chunk_ids: Vec<ChunkId> = chunks.iter().map(Chunk::id).collect();

        if mode == WriteMode::Insert {
            let existing = self.existing_chunks(collection, &document.id).await?;
            if existing > 0 {
                return Err(RagError::DuplicateDocument {
                    collection: collection.to_string(),
                    document_id: document.id.clone(),
                    existing,
                });
            }
        }

        // Embed before touching the stores so a provider failure never
        // leaves an overwritten document half-deleted.
        let embeddings = self.embed_chunks(&chunks).await?;

        let removed = if mode == WriteMode::Overwrite {
            self.remove_both(collection, &document.id).await?
        } else {
            0
        };

        let dense_entries: Vec<_> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| DenseIndex::entry_for(chunk, embedding))
            .collect();
        let sparse_entries: Vec<_> = chunks.iter().map(SparseIndex::entry_for).collect();

        let (dense, sparse) = tokio::join!(
            self.retry.run(Target::Store(StoreKind::Dense), "dense upsert", || {
                self.dense.upsert(collection, &dense_entries)
            }),
            self.retry.run(Target::Store(StoreKind::Sparse), "sparse upsert", || {
                self.sparse.upsert(collection, &sparse_entries)
            }),
        );
        match (dense, sparse) {
            (Err(dense), Err(sparse)) if removed > 0 => {
                return Err(self.lost(collection, &document.id, removed, &chunk_ids, dense, sparse));
            }
            (dense, sparse) => {
                self.settle(collection, &document.id, &chunk_ids, dense, sparse)?;
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        info!(
            chunks = chunk_ids.len(),
            removed,
            latency_ms,
            "Ingested document"
        );

        Ok(IngestReport {
            collection: collection.to_string(),
            document_id: document.id.clone(),
            mode,
            chunk_ids,
            removed,
            latency_ms,
        })
    }

    /// Remove a document from both indexes.
    #[instrument(skip_all, fields(collection = %collection, document_id = %document_id))]
    pub async fn delete_document(&self, collection: &str, document_id: &str) -> Result<DeleteReport> {
        validate_collection(collection)?;
        validate_document_id(document_id)?;

        let (dense_ids, sparse_ids) = self.lookup_ids(collection, document_id).await?;
        let (dense, sparse) = self.delete_both(collection, document_id).await;

        let (dense_removed, sparse_removed) = match (dense, sparse) {
            (Err(d), Err(s)) if d.is_collection_not_found() && s.is_collection_not_found() => {
                return Err(d);
            }
            (dense, sparse) => {
                let dense = dense.or_else(missing_as_default);
                let sparse = sparse.or_else(missing_as_default);
                let ids: Vec<ChunkId> = dense_ids.union(&sparse_ids).cloned().collect();
                self.settle(collection, document_id, &ids, dense, sparse)?
            }
        };

        info!(dense_removed, sparse_removed, "Deleted document");
        Ok(DeleteReport {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            dense_removed,
            sparse_removed,
        })
    }

    /// Drop a collection from both indexes.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn drop_collection(&self, collection: &str) -> Result<()> {
        validate_collection(collection)?;
        let (dense, sparse) = tokio::join!(
            self.retry.run(Target::Store(StoreKind::Dense), "dense drop", || {
                self.dense.drop_collection(collection)
            }),
            self.retry.run(Target::Store(StoreKind::Sparse), "sparse drop", || {
                self.sparse.drop_collection(collection)
            }),
        );

        if let (Err(d), Err(s)) = (&dense, &sparse) {
            if d.is_collection_not_found() && s.is_collection_not_found() {
                return Err(RagError::collection_not_found(collection));
            }
        }
        match (dense.or_else(missing_as_default), sparse.or_else(missing_as_default)) {
            (Ok(()), Ok(())) => {
                self.flags().retain(|(c, _), _| c != collection);
                info!("Dropped collection");
                Ok(())
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(collection, "Collection only partially dropped: {}", e);
                Err(e)
            }
        }
    }

    /// Compare a document's chunk ids across both indexes.
    pub async fn verify(&self, collection: &str, document_id: &str) -> Result<ConsistencyReport> {
        let (dense, sparse) = self.lookup_ids(collection, document_id).await?;
        let report = ConsistencyReport {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            missing_dense: sparse.difference(&dense).cloned().collect(),
            missing_sparse: dense.difference(&sparse).cloned().collect(),
        };
        if !report.is_consistent() {
            warn!(
                collection,
                document_id,
                missing_dense = report.missing_dense.len(),
                missing_sparse = report.missing_sparse.len(),
                "Indexes diverge"
            );
        }
        Ok(report)
    }

    /// Documents flagged by partial failures and not yet repaired.
    pub fn inconsistent_documents(&self) -> Vec<InconsistentDocument> {
        self.flags()
            .iter()
            .map(|((collection, document_id), issue)| InconsistentDocument {
                collection: collection.clone(),
                document_id: document_id.clone(),
                issue: *issue,
            })
            .collect()
    }

    /// Entry counts in both indexes.
    pub async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let (dense, sparse) = tokio::join!(self.dense.count(collection), self.sparse.count(collection));
        Ok(CollectionStats {
            dense_entries: dense?,
            sparse_entries: sparse?,
        })
    }

    /// Number of chunks already indexed for the document in either index.
    async fn existing_chunks(&self, collection: &str, document_id: &str) -> Result<usize> {
        let (dense, sparse) = self.lookup_ids(collection, document_id).await?;
        Ok(dense.len().max(sparse.len()))
    }

    async fn lookup_ids(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<(BTreeSet<ChunkId>, BTreeSet<ChunkId>)> {
        let (dense, sparse) = tokio::join!(
            self.retry.run(Target::Store(StoreKind::Dense), "dense lookup", || {
                self.dense.chunk_ids(collection, document_id)
            }),
            self.retry.run(Target::Store(StoreKind::Sparse), "sparse lookup", || {
                self.sparse.chunk_ids(collection, document_id)
            }),
        );
        Ok((dense?.into_iter().collect(), sparse?.into_iter().collect()))
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self
            .retry
            .run(Target::Provider, "embed", || self.embedder.embed(&texts))
            .await?;
        if embeddings.len() != texts.len() {
            return Err(RagError::provider(format!(
                "Provider returned {} embeddings for {} chunks",
                embeddings.len(),
                texts.len()
            )));
        }
        debug!(chunks = texts.len(), "Embedded chunks");
        Ok(embeddings)
    }

    async fn delete_both(&self, collection: &str, document_id: &str) -> (Result<usize>, Result<usize>) {
        tokio::join!(
            self.retry.run(Target::Store(StoreKind::Dense), "dense delete", || {
                self.dense.delete(collection, document_id)
            }),
            self.retry.run(Target::Store(StoreKind::Sparse), "sparse delete", || {
                self.sparse.delete(collection, document_id)
            }),
        )
    }

    /// OVERWRITE pre-delete. A missing collection means nothing to delete.
    async fn remove_both(&self, collection: &str, document_id: &str) -> Result<usize> {
        let (dense_ids, sparse_ids) = self.lookup_ids(collection, document_id).await?;
        let (dense, sparse) = self.delete_both(collection, document_id).await;
        let ids: Vec<ChunkId> = dense_ids.union(&sparse_ids).cloned().collect();
        let (dense_removed, sparse_removed) = self.settle(
            collection,
            document_id,
            &ids,
            dense.or_else(missing_as_default),
            sparse.or_else(missing_as_default),
        )?;
        debug!(dense_removed, sparse_removed, "Removed previous entries");
        Ok(dense_removed.max(sparse_removed))
    }

    /// Reconcile the outcome of a write applied to both indexes.
    fn settle<D, S>(
        &self,
        collection: &str,
        document_id: &str,
        chunk_ids: &[ChunkId],
        dense: Result<D>,
        sparse: Result<S>,
    ) -> Result<(D, S)> {
        let key = (collection.to_string(), document_id.to_string());
        match (dense, sparse) {
            (Ok(d), Ok(s)) => {
                if self.flags().remove(&key).is_some() {
                    info!(collection, document_id, "Indexes consistent again");
                }
                Ok((d, s))
            }
            // Neither write landed. An OVERWRITE that already removed entries
            // is handled by the caller before reaching here.
            (Err(e), Err(other)) => {
                warn!(collection, document_id, "Both indexes failed: {}; {}", e, other);
                Err(e)
            }
            (Err(e), Ok(_)) => Err(self.diverged(key, StoreKind::Dense, chunk_ids, e)),
            (Ok(_), Err(e)) => Err(self.diverged(key, StoreKind::Sparse, chunk_ids, e)),
        }
    }

    fn diverged(
        &self,
        key: (String, String),
        diverged: StoreKind,
        chunk_ids: &[ChunkId],
        source: RagError,
    ) -> RagError {
        warn!(
            collection = %key.0,
            document_id = %key.1,
            diverged = %diverged,
            chunks = chunk_ids.len(),
            "Partial index failure: {}",
            source
        );
        let (collection, document_id) = key.clone();
        self.flags().insert(key, Inconsistency::Behind(diverged));
        RagError::PartialIndexFailure {
            collection,
            document_id,
            diverged,
            chunk_ids: chunk_ids.iter().map(|id| id.to_string()).collect(),
            source: Box::new(source),
        }
    }

    fn lost(
        &self,
        collection: &str,
        document_id: &str,
        removed: usize,
        chunk_ids: &[ChunkId],
        dense: RagError,
        sparse: RagError,
    ) -> RagError {
        warn!(
            collection,
            document_id,
            removed,
            chunks = chunk_ids.len(),
            "Overwrite removed the document but both writes failed: {}; {}",
            dense,
            sparse
        );
        self.flags().insert(
            (collection.to_string(), document_id.to_string()),
            Inconsistency::Lost,
        );
        RagError::OverwriteLost {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            removed,
            chunk_ids: chunk_ids.iter().map(|id| id.to_string()).collect(),
            source: Box::new(dense),
            other: Box::new(sparse),
        }
    }

    fn flags(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Inconsistency>> {
        self.inconsistent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Treat a missing collection as an empty one.
fn missing_as_default<T: Default>(e: RagError) -> Result<T> {
    if e.is_collection_not_found() {
        Ok(T::default())
    } else {
        Err(e)
    }
}

fn validate_collection(collection: &str) -> Result<()> {
    if collection.trim().is_empty() {
        return Err(RagError::invalid_config("collection name must not be empty"));
    }
    Ok(())
}

fn validate_document_id(document_id: &str) -> Result<()> {
    if document_id.is_empty() {
        return Err(RagError::invalid_config("document id must not be empty"));
    }
    // Chunk ids are "{document}:{index}"; a colon would let one document's
    // prefix match another's chunks.
    if document_id.contains(':') {
        return Err(RagError::invalid_config(format!(
            "document id must not contain ':' (got {:?})",
            document_id
        )));
    }
    Ok(())
}
