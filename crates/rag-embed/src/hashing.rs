//! Deterministic feature-hashing embedder.
//!
//! Every lowercase word is hashed with blake3 into one of `dimension`
//! buckets with a sign taken from the hash, and the bucket counts are L2
//! normalized. Texts that share words get a positive cosine similarity; no
//! model files are needed.

use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

use rag_core::{EmbeddingProvider, RagError, Result};

use crate::onnx::l2_normalize;

/// Default number of hash buckets.
const DEFAULT_DIMENSION: usize = 256;

/// Feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Create an embedder with the default dimension.
    pub fn new() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
        }
    }

    /// Create an embedder with `dimension` buckets.
    pub fn with_dimension(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::invalid_config("embedding dimension must be greater than 0"));
        }
        Ok(Self { dimension })
    }

    /// Embed one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for word in text.unicode_words() {
            let word = word.to_lowercase();
            let hash = blake3::hash(word.as_bytes());
            let bytes = hash.as_bytes();
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&bytes[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[index] += sign;
        }
        l2_normalize(v)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
