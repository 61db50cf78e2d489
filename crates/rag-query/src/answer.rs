//! Answer generation over retrieved passages.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use rag_core::{ChunkId, LanguageModel, RankedChunk, Result, StoreKind};
use rag_index::{RetryPolicy, Target};

use crate::retriever::{HybridRetriever, RetrieveRequest};

/// A model answer and the chunks it was grounded on.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Chunks placed in the prompt, in rank order.
    pub sources: Vec<ChunkId>,
    /// Set when the passages came from a degraded hybrid query.
    pub degraded: Option<StoreKind>,
}

/// Retrieves passages and asks a language model to answer from them.
pub struct AnswerEngine {
    retriever: Arc<HybridRetriever>,
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl AnswerEngine {
    pub fn new(retriever: Arc<HybridRetriever>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            retriever,
            model,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Answer the request's query from the chunks it retrieves.
    #[instrument(skip_all, fields(collection = %request.collection))]
    pub async fn answer(&self, request: &RetrieveRequest) -> Result<Answer> {
        let response = self.retriever.retrieve(request).await?;
        let prompt = render_prompt(&request.query, &response.chunks);
        debug!(passages = response.chunks.len(), prompt_len = prompt.len(), "Rendered prompt");

        let text = self
            .retry
            .run(Target::Provider, "complete", || self.model.complete(&prompt))
            .await?;
        info!(sources = response.chunks.len(), "Answered query");

        Ok(Answer {
            text: text.trim().to_string(),
            sources: response.chunks.into_iter().map(|c| c.chunk_id).collect(),
            degraded: response.degraded,
        })
    }
}

/// Number the passages and append the question.
pub fn render_prompt(query: &str, passages: &[RankedChunk]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the context below. \
         If the context does not contain the answer, say that you don't know.\n\nContext:\n",
    );
    if passages.is_empty() {
        prompt.push_str("(no passages found)\n");
    }
    for (i, passage) in passages.iter().enumerate() {
        let _ = writeln!(prompt, "[{}] {}", i + 1, passage.text.trim());
    }
    let _ = write!(prompt, "\nQuestion: {}\nAnswer:", query.trim());
    prompt
}
