//! Network embedding providers.
//!
//! - **[`OpenAIEmbedder`]** calls the OpenAI embeddings API with batching,
//!   retry and backoff.
//! - **[`OllamaEmbedder`]** calls a local Ollama instance's `/api/embed`.
//!
//! The offline default (`provider = "hashing"`) is the core
//! [`HashingEmbedder`]. Use [`create_embedder`] to pick one from config.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use groundwork_core::embedding::{EmbeddingProvider, HashingEmbedder};

use crate::config::EmbeddingConfig;
use crate::http;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.effective_dims()))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn check_dims(label: &str, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if let Some(v) = vectors.iter().find(|v| v.len() != expected) {
        bail!(
            "{} returned {}-dimensional vectors but embedding.dims = {}",
            label,
            v.len(),
            expected
        );
    }
    Ok(())
}

// ============ OpenAI ============

/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = http::env_key("OPENAI_API_KEY")?;

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            model,
            dims,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/v1/embeddings", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = http::post_json(
                &self.client,
                "OpenAI",
                &endpoint,
                Some(self.api_key.as_str()),
                &body,
                self.max_retries,
            )
            .await?;
            let vectors = parse_openai_response(&json)?;
            if vectors.len() != batch.len() {
                bail!("OpenAI returned {} embeddings for {} inputs", vectors.len(), batch.len());
            }
            out.extend(vectors);
        }
        check_dims("OpenAI", self.dims, &out)?;
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Requires Ollama running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            model,
            dims,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = http::post_json(&self.client, "Ollama", &endpoint, None, &body, self.max_retries).await?;
            out.extend(parse_ollama_response(&json)?);
        }
        check_dims("Ollama", self.dims, &out)?;
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_openai_response_ordered_by_index() {
        let json = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_malformed_responses_error() {
        assert!(parse_openai_response(&json!({ "object": "list" })).is_err());
        assert!(parse_ollama_response(&json!({ "embeddings": [1.0] })).is_err());
    }

    #[test]
    fn test_dimension_mismatch_is_reported() {
        let err = check_dims("Ollama", 3, &[vec![0.0; 3], vec![0.0; 2]]).unwrap_err();
        assert!(err.to_string().contains("2-dimensional"));
    }

    #[tokio::test]
    async fn test_hashing_provider_is_default() {
        let provider = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.dims(), 384);
        let v = provider.embed_one("offline embeddings").await.unwrap();
        assert_eq!(v.len(), 384);
    }
}
