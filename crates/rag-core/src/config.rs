//! Configuration types for the RAG engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};
use crate::types::{FusionWeights, RetrievalMode, SimilarityMetric, WriteMode};

/// Main configuration for the RAG engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    /// Chunking configuration.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval configuration.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Index configuration.
    #[serde(default)]
    pub index: IndexConfig,

    /// Retry configuration for store and provider calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// Unit the chunk window is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    #[default]
    Chars,
    Tokens,
}

/// Chunking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Window length in units.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Units shared by consecutive windows.
    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,

    /// Window unit.
    #[serde(default)]
    pub unit: ChunkUnit,

    /// Tokenizer used when `unit = "tokens"`.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap_size: 100,
            unit: ChunkUnit::Chars,
            tokenizer_path: None,
        }
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default retrieval mode.
    #[serde(default)]
    pub mode: RetrievalMode,

    /// Default number of results.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Weight of the dense list in hybrid fusion.
    #[serde(default = "default_weight")]
    pub dense_weight: f32,

    /// Weight of the sparse list in hybrid fusion.
    #[serde(default = "default_weight")]
    pub sparse_weight: f32,

    /// Hybrid mode fetches `top_k * candidate_multiplier` candidates per index.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    /// Strip metadata from results.
    #[serde(default)]
    pub only_page_content: bool,

    /// Collection used when a request names none.
    #[serde(default = "default_collection")]
    pub default_collection: String,
}

impl RetrievalConfig {
    pub fn weights(&self) -> FusionWeights {
        FusionWeights::new(self.dense_weight, self.sparse_weight)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            top_k: 3,
            dense_weight: 0.5,
            sparse_weight: 0.5,
            candidate_multiplier: 3,
            only_page_content: false,
            default_collection: default_collection(),
        }
    }
}

/// Index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Default write mode for ingestion.
    #[serde(default)]
    pub write_mode: WriteMode,

    /// Dense similarity metric.
    #[serde(default)]
    pub metric: SimilarityMetric,

    /// BM25 term frequency saturation.
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,

    /// BM25 length normalization.
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::Upsert,
            metric: SimilarityMetric::Cosine,
            bm25_k1: 1.5,
            bm25_b: 0.75,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
            multiplier: 2.0,
            operation_timeout_ms: 10_000,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file holding dense entries.
    #[serde(default = "default_dense_path")]
    pub dense_path: PathBuf,

    /// SQLite file holding sparse entries.
    #[serde(default = "default_sparse_path")]
    pub sparse_path: PathBuf,

    /// Enable WAL mode (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// SQLite cache size (negative = KB, positive = pages).
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,

    /// Busy timeout in milliseconds. Must stay below the retry
    /// operation timeout.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dense_path: default_dense_path(),
            sparse_path: default_sparse_path(),
            wal_mode: true,
            cache_size: -64000, // 64MB
            busy_timeout_ms: 5000,
        }
    }
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Path to ONNX model directory (model.onnx + tokenizer.json).
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Output dimension of the model.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Maximum tokens per input; longer inputs are truncated.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Texts per inference batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of threads for CPU inference.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Feed a zeroed `token_type_ids` input (BERT-style models).
    #[serde(default = "default_true")]
    pub token_type_ids: bool,

    /// Prefix prepended to document texts.
    #[serde(default)]
    pub document_prefix: Option<String>,

    /// Prefix prepended to query texts.
    #[serde(default)]
    pub query_prefix: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            dimension: 384,
            max_length: 512,
            batch_size: 32,
            num_threads: 4,
            token_type_ids: true,
            document_prefix: None,
            query_prefix: None,
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    512
}

fn default_overlap_size() -> usize {
    100
}

fn default_top_k() -> usize {
    3
}

fn default_weight() -> f32 {
    0.5
}

fn default_candidate_multiplier() -> usize {
    3
}

fn default_collection() -> String {
    "default".to_string()
}

fn default_bm25_k1() -> f32 {
    1.5
}

fn default_bm25_b() -> f32 {
    0.75
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_max_backoff() -> u64 {
    2000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_operation_timeout() -> u64 {
    10_000
}

fn default_cache_size() -> i32 {
    -64000
}

fn default_busy_timeout() -> u32 {
    5000
}

fn default_dimension() -> usize {
    384
}

fn default_max_length() -> usize {
    512
}

fn default_batch_size() -> usize {
    32
}

fn default_num_threads() -> usize {
    4
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hybrid-rag")
}

fn default_dense_path() -> PathBuf {
    data_dir().join("dense.db")
}

fn default_sparse_path() -> PathBuf {
    data_dir().join("sparse.db")
}

fn default_model_path() -> PathBuf {
    data_dir().join("models").join("all-MiniLM-L6-v2")
}

impl RagConfig {
    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| RagError::Config {
            message: format!("Failed to parse config: {}", e),
        })?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> Result<Self> {
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("hybrid-rag").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        let local_config = PathBuf::from("rag.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        Ok(Self::default())
    }

    /// Override values from `RAG_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RAG_CHUNK_SIZE") {
            self.chunking.chunk_size = parse_env("RAG_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("RAG_OVERLAP_SIZE") {
            self.chunking.overlap_size = parse_env("RAG_OVERLAP_SIZE", &v)?;
        }
        if let Some(v) = lookup("RAG_TOP_K") {
            self.retrieval.top_k = parse_env("RAG_TOP_K", &v)?;
        }
        if let Some(v) = lookup("RAG_RETRIEVAL_MODE") {
            self.retrieval.mode = v.parse()?;
        }
        if let Some(v) = lookup("RAG_WRITE_MODE") {
            self.index.write_mode = v.parse()?;
        }
        if let Some(v) = lookup("RAG_DENSE_WEIGHT") {
            self.retrieval.dense_weight = parse_env("RAG_DENSE_WEIGHT", &v)?;
        }
        if let Some(v) = lookup("RAG_SPARSE_WEIGHT") {
            self.retrieval.sparse_weight = parse_env("RAG_SPARSE_WEIGHT", &v)?;
        }
        if let Some(v) = lookup("RAG_ONLY_PAGE_CONTENT") {
            self.retrieval.only_page_content = parse_env("RAG_ONLY_PAGE_CONTENT", &v)?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            return Err(RagError::invalid_config("chunk_size must be greater than 0"));
        }
        if self.chunking.overlap_size >= self.chunking.chunk_size {
            return Err(RagError::invalid_config(format!(
                "overlap_size ({}) must be smaller than chunk_size ({})",
                self.chunking.overlap_size, self.chunking.chunk_size
            )));
        }
        if self.chunking.unit == ChunkUnit::Tokens && self.chunking.tokenizer_path.is_none() {
            return Err(RagError::invalid_config(
                "token chunking requires chunking.tokenizer_path",
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(RagError::invalid_config("top_k must be greater than 0"));
        }
        self.retrieval.weights().validate()?;
        if self.retrieval.candidate_multiplier == 0 {
            return Err(RagError::invalid_config(
                "candidate_multiplier must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RagError::invalid_config("retry.max_attempts must be at least 1"));
        }
        if u64::from(self.storage.busy_timeout_ms) >= self.retry.operation_timeout_ms {
            return Err(RagError::invalid_config(format!(
                "storage.busy_timeout_ms ({}) must be below retry.operation_timeout_ms ({})",
                self.storage.busy_timeout_ms, self.retry.operation_timeout_ms
            )));
        }
        if self.index.bm25_k1 < 0.0 || !(0.0..=1.0).contains(&self.index.bm25_b) {
            return Err(RagError::invalid_config(
                "bm25_k1 must be non-negative and bm25_b within [0, 1]",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RagError::invalid_config(format!("invalid value for {}: {:?}", key, value)))
}
