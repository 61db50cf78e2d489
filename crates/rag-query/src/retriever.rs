//! Hybrid retriever over the dense and sparse indexes.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use rag_core::{
    EmbeddingProvider, FusionWeights, RagConfig, RagError, RankedChunk, Result, RetrievalConfig,
    RetrievalMode, ScoredChunk, StoreKind,
};
use rag_index::{DenseIndex, RetryPolicy, SparseIndex, Target};

use crate::fusion::fuse;

/// A retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveRequest {
    pub collection: String,
    pub query: String,
    pub top_k: usize,
    pub mode: RetrievalMode,
    /// Only used in hybrid mode.
    pub weights: FusionWeights,
    /// Drop chunk metadata from the response.
    pub only_page_content: bool,
}

impl RetrieveRequest {
    /// Create a hybrid request for the top 3 chunks with equal weights.
    pub fn new(collection: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            query: query.into(),
            top_k: 3,
            mode: RetrievalMode::Hybrid,
            weights: FusionWeights::default(),
            only_page_content: false,
        }
    }

    /// Create a request against the configured default collection.
    pub fn from_config(config: &RetrievalConfig, query: impl Into<String>) -> Self {
        Self {
            collection: config.default_collection.clone(),
            query: query.into(),
            top_k: config.top_k,
            mode: config.mode,
            weights: config.weights(),
            only_page_content: config.only_page_content,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_mode(mut self, mode: RetrievalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_weights(mut self, dense: f32, sparse: f32) -> Self {
        self.weights = FusionWeights::new(dense, sparse);
        self
    }

    pub fn with_only_page_content(mut self, only_page_content: bool) -> Self {
        self.only_page_content = only_page_content;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(RagError::invalid_config("collection name must not be empty"));
        }
        if self.query.trim().is_empty() {
            return Err(RagError::invalid_config("query must not be empty"));
        }
        if self.top_k == 0 {
            return Err(RagError::invalid_config("top_k must be greater than 0"));
        }
        if self.mode == RetrievalMode::Hybrid {
            self.weights.validate()?;
        }
        Ok(())
    }
}

/// Ranked chunks for a query.
#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResponse {
    pub query: String,
    pub mode: RetrievalMode,
    pub chunks: Vec<RankedChunk>,
    /// The index left out of a hybrid query because it failed.
    pub degraded: Option<StoreKind>,
    pub latency_ms: u64,
}

impl RetrieveResponse {
    /// Chunk texts in rank order.
    pub fn texts(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.text.as_str()).collect()
    }
}

/// Hybrid retriever.
///
/// Reads never mutate either index; a retriever can be shared freely.
pub struct HybridRetriever {
    dense: Arc<DenseIndex>,
    sparse: Arc<SparseIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    candidate_multiplier: usize,
    defaults: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        dense: Arc<DenseIndex>,
        sparse: Arc<SparseIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            dense,
            sparse,
            embedder,
            retry: RetryPolicy::default(),
            candidate_multiplier: 3,
            defaults: RetrievalConfig::default(),
        }
    }

    /// Create a retriever from configuration.
    pub fn from_config(
        config: &RagConfig,
        dense: Arc<DenseIndex>,
        sparse: Arc<SparseIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let mut retriever = Self::new(dense, sparse, embedder)
            .with_retry(RetryPolicy::from(&config.retry))
            .with_candidate_multiplier(config.retrieval.candidate_multiplier);
        retriever.defaults = config.retrieval.clone();
        Ok(retriever)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Hybrid candidates fetched per index, as a multiple of `top_k`.
    pub fn with_candidate_multiplier(mut self, multiplier: usize) -> Self {
        self.candidate_multiplier = multiplier.max(1);
        self
    }

    /// A request for `query` carrying the configured defaults.
    pub fn request(&self, query: impl Into<String>) -> RetrieveRequest {
        RetrieveRequest::from_config(&self.defaults, query)
    }

    /// Rank chunks of a collection against a query.
    #[instrument(skip_all, fields(collection = %request.collection, mode = %request.mode, top_k = request.top_k))]
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse> {
        let start = Instant::now();
        request.validate()?;

        let (mut chunks, degraded) = match request.mode {
            RetrievalMode::Dense => {
                let hits = self.dense_hits(request, request.top_k).await?;
                (hits.into_iter().map(|h| ranked(h, StoreKind::Dense)).collect(), None)
            }
            RetrievalMode::Bm25 => {
                let hits = self.sparse_hits(request, request.top_k).await?;
                (hits.into_iter().map(|h| ranked(h, StoreKind::Sparse)).collect(), None)
            }
            RetrievalMode::Hybrid => self.hybrid(request).await?,
        };

        if request.only_page_content {
            for chunk in &mut chunks {
                chunk.metadata = None;
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        info!(results = chunks.len(), degraded = ?degraded, latency_ms, "Retrieved chunks");

        Ok(RetrieveResponse {
            query: request.query.clone(),
            mode: request.mode,
            chunks,
            degraded,
            latency_ms,
        })
    }

    async fn hybrid(&self, request: &RetrieveRequest) -> Result<(Vec<RankedChunk>, Option<StoreKind>)> {
        let candidates = request
            .top_k
            .max(request.top_k.saturating_mul(self.candidate_multiplier));
        let weights = request.weights;

        // An index with weight 0 cannot change the ranking, so it is not queried.
        let (dense, sparse) = tokio::join!(
            async {
                if weights.dense > 0.0 {
                    self.dense_hits(request, candidates).await
                } else {
                    Ok(Vec::new())
                }
            },
            async {
                if weights.sparse > 0.0 {
                    self.sparse_hits(request, candidates).await
                } else {
                    Ok(Vec::new())
                }
            },
        );
        debug!(
            candidates,
            dense = dense.as_ref().map(Vec::len).ok(),
            sparse = sparse.as_ref().map(Vec::len).ok(),
            "Fetched hybrid candidates"
        );

        match (dense, sparse) {
            (Ok(dense), Ok(sparse)) => Ok((fuse(&dense, &sparse, weights, request.top_k), None)),
            (Err(e), Err(other)) => {
                warn!("Both indexes failed: {}; {}", e, other);
                Err(e)
            }
            (Err(e), Ok(sparse)) => {
                self.degrade(StoreKind::Dense, weights, e)?;
                Ok((fuse(&[], &sparse, weights, request.top_k), Some(StoreKind::Dense)))
            }
            (Ok(dense), Err(e)) => {
                self.degrade(StoreKind::Sparse, weights, e)?;
                Ok((fuse(&dense, &[], weights, request.top_k), Some(StoreKind::Sparse)))
            }
        }
    }

    /// Decide whether the surviving index can answer alone.
    fn degrade(&self, failed: StoreKind, weights: FusionWeights, e: RagError) -> Result<()> {
        if weights.weight(failed.other()) <= 0.0 {
            return Err(e);
        }
        warn!(failed = %failed, "Hybrid query degraded to a single index: {}", e);
        Ok(())
    }

    async fn dense_hits(&self, request: &RetrieveRequest, top_n: usize) -> Result<Vec<ScoredChunk>> {
        let embedding = self
            .retry
            .run(Target::Provider, "embed query", || self.embedder.embed_query(&request.query))
            .await?;
        self.retry
            .run(Target::Store(StoreKind::Dense), "dense search", || {
                self.dense.search(&request.collection, &embedding, top_n)
            })
            .await
    }

    async fn sparse_hits(&self, request: &RetrieveRequest, top_n: usize) -> Result<Vec<ScoredChunk>> {
        self.retry
            .run(Target::Store(StoreKind::Sparse), "sparse search", || {
                self.sparse.search(&request.collection, &request.query, top_n)
            })
            .await
    }
}

/// A single-index hit keeps its raw score.
fn ranked(hit: ScoredChunk, kind: StoreKind) -> RankedChunk {
    let (dense_score, sparse_score) = match kind {
        StoreKind::Dense => (Some(hit.score), None),
        StoreKind::Sparse => (None, Some(hit.score)),
    };
    RankedChunk {
        chunk_id: hit.chunk_id,
        score: hit.score,
        text: hit.text,
        metadata: Some(hit.metadata),
        dense_score,
        sparse_score,
    }
}
