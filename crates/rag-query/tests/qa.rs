use std::sync::Arc;

use rag_chunk::SlidingWindowChunker;
use rag_core::SimilarityMetric;
use rag_embed::HashingEmbedder;
use rag_index::{DenseIndex, IndexManager, SparseIndex};
use rag_query::{HybridRetriever, QaKnowledge, QA_COLLECTION};
use rag_store::{MemoryDocumentStore, MemoryVectorStore};

struct Fixture {
    qa: QaKnowledge,
    manager: Arc<IndexManager>,
}

fn fixture() -> Fixture {
    let dense = Arc::new(DenseIndex::new(
        Arc::new(MemoryVectorStore::new()),
        SimilarityMetric::Cosine,
    ));
    let sparse = Arc::new(SparseIndex::new(Arc::new(MemoryDocumentStore::new())));
    let embedder = Arc::new(HashingEmbedder::new());
    // a small default window that would split every description
    let manager = Arc::new(IndexManager::new(
        SlidingWindowChunker::new(8, 2).unwrap(),
        dense.clone(),
        sparse.clone(),
        embedder.clone(),
    ));
    let retriever = Arc::new(HybridRetriever::new(dense, sparse, embedder));
    Fixture {
        qa: QaKnowledge::new(manager.clone(), retriever),
        manager,
    }
}

#[tokio::test]
async fn test_description_is_indexed_as_one_chunk() {
    let f = fixture();
    let report = f
        .qa
        .index(
            "database connection refused on startup",
            "start the postgres service",
            &["db", "postgres"],
        )
        .await
        .unwrap();

    assert_eq!(report.chunk_ids.len(), 1);
    assert_eq!(report.collection, QA_COLLECTION);
    assert_eq!(
        report.document_id,
        QaKnowledge::document_id("database connection refused on startup")
    );
    let stats = f.manager.stats(QA_COLLECTION).await.unwrap();
    assert_eq!((stats.dense_entries, stats.sparse_entries), (1, 1));
}

#[tokio::test]
async fn test_retrieve_returns_best_solution() {
    let f = fixture();
    f.qa
        .index("database connection refused", "start the postgres service", &["db"])
        .await
        .unwrap();
    f.qa
        .index("disk quota exceeded while writing logs", "rotate the log files", &["disk"])
        .await
        .unwrap();
    f.qa
        .index("permission denied opening config file", "fix the file mode", &[])
        .await
        .unwrap();

    let entry = f
        .qa
        .retrieve("connection refused by the database on port 5432")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.error_desc, "database connection refused");
    assert_eq!(entry.solution, "start the postgres service");
    assert_eq!(entry.tags, vec!["db"]);
}

#[tokio::test]
async fn test_reindexing_a_description_replaces_its_solution() {
    let f = fixture();
    f.qa
        .index("out of memory in worker", "raise the memory limit", &["oom"])
        .await
        .unwrap();
    f.qa
        .index("out of memory in worker", "stream the input instead", &["oom", "io"])
        .await
        .unwrap();

    let stats = f.manager.stats(QA_COLLECTION).await.unwrap();
    assert_eq!(stats.dense_entries, 1);

    let entry = f.qa.retrieve("worker out of memory").await.unwrap().unwrap();
    assert_eq!(entry.solution, "stream the input instead");
    assert_eq!(entry.tags, vec!["oom", "io"]);
}

#[tokio::test]
async fn test_empty_knowledge_base_and_bad_input() {
    let f = fixture();
    assert!(f.qa.retrieve("anything at all").await.unwrap().is_none());

    let err = f.qa.index("   ", "nothing", &[]).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIG");
}
