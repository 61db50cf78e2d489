//! ONNX-based embedding model implementation.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use ndarray::ArrayViewD;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer};
use tracing::{debug, info};

use rag_core::{EmbeddingConfig, EmbeddingProvider, RagError, Result};

/// File names expected inside the model directory.
const MODEL_FILE: &str = "model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// ONNX-based embedder for sentence-transformer style models.
pub struct OnnxEmbedder {
    /// ONNX inference session (wrapped in Mutex for interior mutability).
    session: Mutex<Session>,

    /// Tokenizer for the model.
    tokenizer: Tokenizer,

    /// Embedding dimension.
    dimension: usize,

    /// Inputs longer than this are truncated.
    max_length: usize,

    /// Texts per inference call.
    batch_size: usize,

    /// Whether the graph takes a `token_type_ids` input.
    token_type_ids: bool,

    document_prefix: String,
    query_prefix: String,
}

impl OnnxEmbedder {
    /// Load `model.onnx` and `tokenizer.json` from the configured model directory.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let model_file = config.model_path.join(MODEL_FILE);
        let tokenizer_file = config.model_path.join(TOKENIZER_FILE);
        Self::new(&model_file, &tokenizer_file, config)
    }

    /// Create an embedder from explicit model and tokenizer paths.
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `tokenizer_path` - Path to the tokenizer.json file
    /// * `config` - Dimension, batching, threading and prefix settings
    pub fn new(model_path: &Path, tokenizer_path: &Path, config: &EmbeddingConfig) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()
            .map_err(|e| RagError::provider(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RagError::provider(format!("Failed to set optimization level: {}", e)))?
            .with_intra_threads(config.num_threads)
            .map_err(|e| RagError::provider(format!("Failed to set thread count: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| RagError::provider(format!("Failed to load model: {}", e)))?;

        info!("Loading tokenizer from {:?}", tokenizer_path);

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| RagError::provider(format!("Failed to load tokenizer: {}", e)))?;

        info!(
            "Embedder initialized: dim={}, max_length={}",
            config.dimension, config.max_length
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimension: config.dimension,
            max_length: config.max_length.max(1),
            batch_size: config.batch_size.max(1),
            token_type_ids: config.token_type_ids,
            document_prefix: config.document_prefix.clone().unwrap_or_default(),
            query_prefix: config.query_prefix.clone().unwrap_or_default(),
        })
    }

    /// Embed texts in batches with a given prefix.
    fn embed_prefixed(&self, texts: &[&str], prefix: &str) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch, prefix)?);
        }
        Ok(out)
    }

    fn embed_batch(&self, texts: &[&str], prefix: &str) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prefixed: Vec<String> = texts.iter().map(|t| format!("{}{}", prefix, t)).collect();
        let prefixed_refs: Vec<&str> = prefixed.iter().map(|s| s.as_str()).collect();

        let encodings = self
            .tokenizer
            .encode_batch(prefixed_refs, true)
            .map_err(|e| RagError::provider(format!("Tokenization failed: {}", e)))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .clamp(1, self.max_length);
        let batch_size = encodings.len();

        debug!("Embedding batch: size={}, max_len={}", batch_size, max_len);

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            for j in 0..ids.len().min(max_len) {
                input_ids[i * max_len + j] = ids[j] as i64;
                attention_mask[i * max_len + j] = mask[j] as i64;
            }
        }

        let shape = vec![batch_size, max_len];
        let input_ids_tensor = Tensor::from_array((shape.clone(), input_ids))
            .map_err(|e| RagError::provider(format!("Failed to create input tensor: {}", e)))?;
        let attention_mask_tensor = Tensor::from_array((shape.clone(), attention_mask))
            .map_err(|e| RagError::provider(format!("Failed to create mask tensor: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| RagError::provider(format!("Failed to lock session: {}", e)))?;

        let outputs = if self.token_type_ids {
            let token_type_tensor = Tensor::from_array((shape, vec![0i64; batch_size * max_len]))
                .map_err(|e| {
                    RagError::provider(format!("Failed to create token type tensor: {}", e))
                })?;
            session.run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_tensor
            ])
        } else {
            session.run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor
            ])
        }
        .map_err(|e| RagError::provider(format!("Inference failed: {}", e)))?;

        // Models name their outputs differently; the first one holds the hidden states.
        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| RagError::provider("No output tensor found"))?;

        let view = output
            .try_extract_array::<f32>()
            .map_err(|e| RagError::provider(format!("Failed to extract tensor: {}", e)))?;

        let embeddings = match view.ndim() {
            // (batch, seq, hidden)
            3 => mean_pool(&view, &encodings, max_len),
            // (batch, hidden), already pooled
            2 => (0..batch_size)
                .map(|i| l2_normalize((0..view.shape()[1]).map(|j| view[[i, j]]).collect()))
                .collect(),
            _ => {
                return Err(RagError::provider(format!(
                    "Unexpected output shape: {:?}",
                    view.shape()
                )))
            }
        };

        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }
        Ok(embeddings)
    }
}

/// Mean pooling over the sequence dimension, counting only attended tokens.
fn mean_pool(tensor: &ArrayViewD<'_, f32>, encodings: &[Encoding], max_len: usize) -> Vec<Vec<f32>> {
    let seq_len = tensor.shape()[1].min(max_len);
    let hidden_dim = tensor.shape()[2];

    encodings
        .iter()
        .enumerate()
        .map(|(i, encoding)| {
            let mask = encoding.get_attention_mask();
            let mut sum = vec![0.0f32; hidden_dim];
            let mut attended = 0usize;
            for (j, _) in mask.iter().take(seq_len).enumerate().filter(|(_, m)| **m == 1) {
                attended += 1;
                for (k, s) in sum.iter_mut().enumerate() {
                    *s += tensor[[i, j, k]];
                }
            }
            if attended == 0 {
                return sum;
            }
            l2_normalize(sum.into_iter().map(|s| s / attended as f32).collect())
        })
        .collect()
}

/// L2 normalize a vector.
pub(crate) fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        // Inference is synchronous and runs on the calling task.
        self.embed_prefixed(texts, &self.document_prefix)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_prefixed(&[text], &self.query_prefix)?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::provider("No embedding returned"))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
