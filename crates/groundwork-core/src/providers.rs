//! Capability providers consumed by the pipeline.
//!
//! Embedding lives in [`crate::embedding`]; these are the remaining three:
//! text generation, cross-encoder scoring and web search. Concrete HTTP
//! implementations are in the `groundwork` app crate.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Text generation backend (chat or completion model).
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String>;
}

/// Joint (query, passage) relevance scorer.
///
/// Scores may be probabilities in `[0, 1]` or raw logits; the
/// [`Reranker`](crate::rerank::Reranker) normalizes either.
#[async_trait]
pub trait CrossEncoderProvider: Send + Sync {
    async fn score(&self, query: &str, passage: &str) -> Result<f64>;

    /// Score many passages against one query, in order.
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(passages.len());
        for passage in passages {
            out.push(self.score(query, passage).await?);
        }
        Ok(out)
    }
}

/// One search hit, already summarized by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebHit {
    pub url: String,
    pub title: String,
    pub content: String,
    /// Provider relevance, nominally in `[0, 1]`.
    pub relevance: f64,
}

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    async fn search_and_summarize(&self, query: &str) -> Result<Vec<WebHit>>;
}
