use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use rag_chunk::SlidingWindowChunker;
use rag_core::{
    ChunkId, DenseEntry, Document, DocumentStore, EmbeddingProvider, RagError, Result,
    ScoredChunk, SimilarityMetric, SparseEntry, StoreKind, VectorStore, WriteMode,
};
use rag_embed::HashingEmbedder;
use rag_index::{DenseIndex, Inconsistency, IndexManager, RetryPolicy, SparseIndex};
use rag_store::{MemoryDocumentStore, MemoryVectorStore};

const FOX: &str = "the quick brown fox jumps over the lazy dog";

/// Wraps a store and fails every write while `failing` is set, or only
/// upserts while `failing_upserts` is set.
struct Flaky<S> {
    inner: S,
    kind: StoreKind,
    failing: AtomicBool,
    failing_upserts: AtomicBool,
}

impl<S> Flaky<S> {
    fn new(inner: S, kind: StoreKind) -> Self {
        Self {
            inner,
            kind,
            failing: AtomicBool::new(false),
            failing_upserts: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn set_failing_upserts(&self, failing: bool) {
        self.failing_upserts.store(failing, Ordering::SeqCst);
    }

    fn check_upsert(&self) -> Result<()> {
        if self.failing_upserts.load(Ordering::SeqCst) {
            return Err(RagError::store(self.kind, "down"));
        }
        self.check()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RagError::store(self.kind, "injected outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VectorStore for Flaky<MemoryVectorStore> {
    async fn upsert(&self, collection: &str, entries: &[DenseEntry]) -> Result<()> {
        self.check_upsert()?;
        self.inner.upsert(collection, entries).await
    }

    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize> {
        self.check()?;
        self.inner.delete_prefix(collection, prefix).await
    }

    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>> {
        self.inner.ids_with_prefix(collection, prefix).await
    }

    async fn nearest(
        &self,
        collection: &str,
        query: &[f32],
        top_n: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<ScoredChunk>> {
        self.inner.nearest(collection, query, top_n, metric).await
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.inner.count(collection).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.check()?;
        self.inner.drop_collection(collection).await
    }
}

#[async_trait]
impl DocumentStore for Flaky<MemoryDocumentStore> {
    async fn upsert(&self, collection: &str, entries: &[SparseEntry]) -> Result<()> {
        self.check_upsert()?;
        self.inner.upsert(collection, entries).await
    }

    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize> {
        self.check()?;
        self.inner.delete_prefix(collection, prefix).await
    }

    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>> {
        self.inner.ids_with_prefix(collection, prefix).await
    }

    async fn scan(&self, collection: &str) -> Result<Vec<SparseEntry>> {
        self.inner.scan(collection).await
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.inner.count(collection).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.check()?;
        self.inner.drop_collection(collection).await
    }
}

/// Embedder that drops the last vector of every batch.
struct ShortEmbedder;

#[async_trait]
impl EmbeddingProvider for ShortEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().skip(1).map(|_| vec![1.0, 0.0]).collect())
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct Harness {
    manager: IndexManager,
    dense_store: Arc<Flaky<MemoryVectorStore>>,
    sparse_store: Arc<Flaky<MemoryDocumentStore>>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 2.0,
        operation_timeout: Duration::from_secs(5),
    }
}

fn harness() -> Harness {
    let dense_store = Arc::new(Flaky::new(MemoryVectorStore::new(), StoreKind::Dense));
    let sparse_store = Arc::new(Flaky::new(MemoryDocumentStore::new(), StoreKind::Sparse));
    let manager = IndexManager::new(
        SlidingWindowChunker::new(20, 5).unwrap(),
        Arc::new(DenseIndex::new(dense_store.clone(), SimilarityMetric::Cosine)),
        Arc::new(SparseIndex::new(sparse_store.clone())),
        Arc::new(HashingEmbedder::new()),
    )
    .with_retry(fast_retry());

    Harness {
        manager,
        dense_store,
        sparse_store,
    }
}

fn ids(raw: &[&str]) -> Vec<ChunkId> {
    raw.iter().map(|id| ChunkId::from_raw(*id)).collect()
}

#[tokio::test]
async fn test_insert_writes_both_indexes() {
    let h = harness();
    let report = h
        .manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap();

    assert_eq!(report.chunk_ids, ids(&["doc1:0", "doc1:1", "doc1:2"]));
    assert_eq!(report.removed, 0);

    let stats = h.manager.stats("kb").await.unwrap();
    assert_eq!(stats.dense_entries, 3);
    assert_eq!(stats.sparse_entries, 3);
    assert!(h.manager.verify("kb", "doc1").await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_insert_rejects_existing_document_without_writing() {
    let h = harness();
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap();

    let err = h
        .manager
        .ingest("kb", &Document::new("doc1", "completely different text here"), WriteMode::Insert)
        .await
        .unwrap_err();
    match err {
        RagError::DuplicateDocument { existing, ref document_id, .. } => {
            assert_eq!(existing, 3);
            assert_eq!(document_id, "doc1");
        }
        other => panic!("unexpected error: {other}"),
    }

    let hits = SparseIndex::new(h.sparse_store.clone())
        .search("kb", "quick", 10)
        .await
        .unwrap();
    assert_eq!(hits[0].chunk_id, ChunkId::new("doc1", 0));
    assert_eq!(h.manager.stats("kb").await.unwrap().sparse_entries, 3);
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let h = harness();
    let doc = Document::new("doc1", FOX);
    let first = h.manager.ingest("kb", &doc, WriteMode::Upsert).await.unwrap();
    let second = h.manager.ingest("kb", &doc, WriteMode::Upsert).await.unwrap();

    assert_eq!(first.chunk_ids, second.chunk_ids);
    let stats = h.manager.stats("kb").await.unwrap();
    assert_eq!(stats.dense_entries, 3);
    assert_eq!(stats.sparse_entries, 3);
}

#[tokio::test]
async fn test_upsert_keeps_stale_trailing_chunks() {
    let h = harness();
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Upsert)
        .await
        .unwrap();
    h.manager
        .ingest("kb", &Document::new("doc1", "a shorter text"), WriteMode::Upsert)
        .await
        .unwrap();

    let dense = DenseIndex::new(h.dense_store.clone(), SimilarityMetric::Cosine);
    assert_eq!(dense.chunk_ids("kb", "doc1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_overwrite_removes_orphaned_chunks() {
    let h = harness();
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap();

    let report = h
        .manager
        .ingest("kb", &Document::new("doc1", "a shorter text"), WriteMode::Overwrite)
        .await
        .unwrap();
    assert_eq!(report.removed, 3);
    assert_eq!(report.chunk_ids, ids(&["doc1:0"]));

    let stats = h.manager.stats("kb").await.unwrap();
    assert_eq!(stats.dense_entries, 1);
    assert_eq!(stats.sparse_entries, 1);

    let hits = SparseIndex::new(h.sparse_store.clone())
        .search("kb", "fox", 10)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_overwrite_into_new_collection() {
    let h = harness();
    let report = h
        .manager
        .ingest("fresh", &Document::new("doc1", FOX), WriteMode::Overwrite)
        .await
        .unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.chunk_ids.len(), 3);
}

#[tokio::test]
async fn test_partial_failure_flags_document_until_repaired() {
    let h = harness();
    h.sparse_store.set_failing(true);

    let err = h
        .manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Upsert)
        .await
        .unwrap_err();
    match &err {
        RagError::PartialIndexFailure { diverged, chunk_ids, source, .. } => {
            assert_eq!(*diverged, StoreKind::Sparse);
            assert_eq!(chunk_ids, &vec!["doc1:0", "doc1:1", "doc1:2"]);
            assert!(matches!(**source, RagError::StoreUnavailable { store: StoreKind::Sparse, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.error_code(), "PARTIAL_INDEX_FAILURE");

    let flagged = h.manager.inconsistent_documents();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].document_id, "doc1");
    assert_eq!(flagged[0].issue, Inconsistency::Behind(StoreKind::Sparse));

    let report = h.manager.verify("kb", "doc1").await.unwrap();
    assert_eq!(report.missing_sparse, ids(&["doc1:0", "doc1:1", "doc1:2"]));
    assert!(report.missing_dense.is_empty());

    h.sparse_store.set_failing(false);
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Upsert)
        .await
        .unwrap();

    assert!(h.manager.inconsistent_documents().is_empty());
    assert!(h.manager.verify("kb", "doc1").await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_failure_on_both_sides_is_not_partial() {
    let h = harness();
    h.dense_store.set_failing(true);
    h.sparse_store.set_failing(true);

    let err = h
        .manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Upsert)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::StoreUnavailable { .. }));
    assert!(h.manager.inconsistent_documents().is_empty());
}

#[tokio::test]
async fn test_overwrite_failing_both_writes_flags_lost_document() {
    let h = harness();
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap();

    // deletes still work, every upsert fails
    h.dense_store.set_failing_upserts(true);
    h.sparse_store.set_failing_upserts(true);

    let err = h
        .manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Overwrite)
        .await
        .unwrap_err();
    match &err {
        RagError::OverwriteLost { document_id, removed, chunk_ids, source, other, .. } => {
            assert_eq!(document_id, "doc1");
            assert_eq!(*removed, 3);
            assert_eq!(chunk_ids.len(), 3);
            assert!(matches!(**source, RagError::StoreUnavailable { store: StoreKind::Dense, .. }));
            assert!(matches!(**other, RagError::StoreUnavailable { store: StoreKind::Sparse, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.error_code(), "OVERWRITE_LOST");

    let stats = h.manager.stats("kb").await.unwrap();
    assert_eq!((stats.dense_entries, stats.sparse_entries), (0, 0));
    let flagged = h.manager.inconsistent_documents();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].document_id, "doc1");
    assert_eq!(flagged[0].issue, Inconsistency::Lost);

    // a later successful write clears the flag
    h.dense_store.set_failing_upserts(false);
    h.sparse_store.set_failing_upserts(false);
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Overwrite)
        .await
        .unwrap();
    assert!(h.manager.inconsistent_documents().is_empty());
}

#[tokio::test]
async fn test_overwrite_of_new_document_failing_both_writes_is_plain_error() {
    let h = harness();
    h.dense_store.set_failing_upserts(true);
    h.sparse_store.set_failing_upserts(true);

    let err = h
        .manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Overwrite)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::StoreUnavailable { .. }));
    assert!(h.manager.inconsistent_documents().is_empty());
}

#[tokio::test]
async fn test_provider_failure_leaves_indexes_untouched() {
    let h = harness();
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap();

    let manager = IndexManager::new(
        SlidingWindowChunker::new(20, 5).unwrap(),
        Arc::new(DenseIndex::new(h.dense_store.clone(), SimilarityMetric::Cosine)),
        Arc::new(SparseIndex::new(h.sparse_store.clone())),
        Arc::new(ShortEmbedder),
    )
    .with_retry(fast_retry());

    let err = manager
        .ingest("kb", &Document::new("doc1", "replacement text for the document"), WriteMode::Overwrite)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "PROVIDER_ERROR");

    let stats = h.manager.stats("kb").await.unwrap();
    assert_eq!(stats.dense_entries, 3);
    assert_eq!(stats.sparse_entries, 3);
}

#[tokio::test]
async fn test_delete_document() {
    let h = harness();
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap();
    h.manager
        .ingest("kb", &Document::new("doc10", "another document"), WriteMode::Insert)
        .await
        .unwrap();

    let report = h.manager.delete_document("kb", "doc1").await.unwrap();
    assert_eq!(report.dense_removed, 3);
    assert_eq!(report.sparse_removed, 3);

    let stats = h.manager.stats("kb").await.unwrap();
    assert_eq!(stats.dense_entries, 1);
    assert_eq!(stats.sparse_entries, 1);

    let again = h.manager.delete_document("kb", "doc1").await.unwrap();
    assert_eq!(again.dense_removed, 0);

    let err = h.manager.delete_document("missing", "doc1").await.unwrap_err();
    assert!(err.is_collection_not_found());
}

#[tokio::test]
async fn test_drop_collection() {
    let h = harness();
    h.manager
        .ingest("kb", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap();

    h.manager.drop_collection("kb").await.unwrap();
    assert_eq!(h.manager.stats("kb").await.unwrap().dense_entries, 0);

    let err = h.manager.drop_collection("kb").await.unwrap_err();
    assert!(err.is_collection_not_found());
}

#[tokio::test]
async fn test_empty_document_indexes_nothing() {
    let h = harness();
    let report = h
        .manager
        .ingest("kb", &Document::new("empty", ""), WriteMode::Insert)
        .await
        .unwrap();
    assert!(report.chunk_ids.is_empty());
    assert_eq!(h.manager.stats("kb").await.unwrap().sparse_entries, 0);
}

#[tokio::test]
async fn test_invalid_identifiers_are_rejected() {
    let h = harness();
    let err = h
        .manager
        .ingest("kb", &Document::new("a:b", FOX), WriteMode::Insert)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIG");

    let err = h
        .manager
        .ingest("  ", &Document::new("doc1", FOX), WriteMode::Insert)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIG");
}
