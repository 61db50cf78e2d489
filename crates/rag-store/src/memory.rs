//! In-memory stores.
//!
//! Collections live in `RwLock`ed maps keyed by collection name, entries in
//! `BTreeMap`s keyed by chunk id so prefix lookups and scans come out ordered.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use rag_core::{
    ChunkId, DenseEntry, DocumentStore, RagError, Result, ScoredChunk, SimilarityMetric,
    SparseEntry, VectorStore,
};

use crate::rank::rank;

fn with_prefix<'a, V>(
    entries: &'a BTreeMap<ChunkId, V>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a ChunkId> + 'a {
    entries
        .range(ChunkId::from_raw(prefix)..)
        .map(|(id, _)| id)
        .take_while(move |id| id.as_str().starts_with(prefix))
}

fn remove_prefix<V>(entries: &mut BTreeMap<ChunkId, V>, prefix: &str) -> usize {
    let doomed: Vec<ChunkId> = with_prefix(entries, prefix).cloned().collect();
    for id in &doomed {
        entries.remove(id);
    }
    doomed.len()
}

#[derive(Default)]
struct DenseCollection {
    dimension: usize,
    entries: BTreeMap<ChunkId, DenseEntry>,
}

/// Vector store held in process memory.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, DenseCollection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, collection: &str, entries: &[DenseEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };

        let mut collections = self.collections.write().await;
        let expected = collections
            .get(collection)
            .map(|c| c.dimension)
            .unwrap_or(first.embedding.len());
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != expected) {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.embedding.len(),
            });
        }

        let target = collections
            .entry(collection.to_string())
            .or_insert_with(|| DenseCollection {
                dimension: expected,
                entries: BTreeMap::new(),
            });
        for entry in entries {
            target.entries.insert(entry.chunk_id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| RagError::collection_not_found(collection))?;
        Ok(remove_prefix(&mut target.entries, prefix))
    }

    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| with_prefix(&c.entries, prefix).cloned().collect())
            .unwrap_or_default())
    }

    async fn nearest(
        &self,
        collection: &str,
        query: &[f32],
        top_n: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<ScoredChunk>> {
        let collections = self.collections.read().await;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        if target.dimension != query.len() {
            return Err(RagError::DimensionMismatch {
                expected: target.dimension,
                actual: query.len(),
            });
        }

        let hits = target
            .entries
            .values()
            .map(|e| ScoredChunk {
                chunk_id: e.chunk_id.clone(),
                score: metric.score(query, &e.embedding),
                text: e.text.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();
        Ok(rank(hits, top_n))
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map(|c| c.entries.len()).unwrap_or(0))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections
            .remove(collection)
            .map(|_| ())
            .ok_or_else(|| RagError::collection_not_found(collection))
    }
}

/// Document store held in process memory.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<ChunkId, SparseEntry>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, collection: &str, entries: &[SparseEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();
        for entry in entries {
            target.insert(entry.chunk_id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| RagError::collection_not_found(collection))?;
        Ok(remove_prefix(target, prefix))
    }

    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| with_prefix(c, prefix).cloned().collect())
            .unwrap_or_default())
    }

    async fn scan(&self, collection: &str) -> Result<Vec<SparseEntry>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map(|c| c.len()).unwrap_or(0))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections
            .remove(collection)
            .map(|_| ())
            .ok_or_else(|| RagError::collection_not_found(collection))
    }
}
