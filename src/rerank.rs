//! Cross-encoder scoring over HTTP.
//!
//! Speaks the text-embeddings-inference `/rerank` shape:
//! request `{query, texts}`, response `[{index, score}]`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use groundwork_core::providers::CrossEncoderProvider;

use crate::config::RerankConfig;
use crate::http;

pub fn create_cross_encoder(config: &RerankConfig) -> Result<Option<Arc<dyn CrossEncoderProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpCrossEncoder::new(config)?))),
        other => bail!("Unknown rerank provider: {}", other),
    }
}

pub struct HttpCrossEncoder {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpCrossEncoder {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("rerank.url required for http provider"))?;
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            endpoint: format!("{}/rerank", url.trim_end_matches('/')),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl CrossEncoderProvider for HttpCrossEncoder {
    async fn score(&self, query: &str, passage: &str) -> Result<f64> {
        let scores = self.score_batch(query, &[passage.to_string()]).await?;
        scores
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Reranker returned no score"))
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "query": query, "texts": passages });
        let json = http::post_json(&self.client, "Reranker", &self.endpoint, None, &body, self.max_retries).await?;
        parse_rerank_response(&json, passages.len())
    }
}

/// Scores come back sorted by relevance; put them back in input order.
fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f64>> {
    let items = json
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: expected an array"))?;

    let mut scores = vec![None; expected];
    for item in items {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing index"))? as usize;
        let score = item
            .get("score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing score"))?;
        match scores.get_mut(index) {
            Some(slot) => *slot = Some(score),
            None => bail!("Invalid rerank response: index {} out of range", index),
        }
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| anyhow::anyhow!("Reranker returned no score for passage {}", i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scores_restored_to_input_order() {
        let json = json!([
            { "index": 2, "score": 0.9 },
            { "index": 0, "score": 0.4 },
            { "index": 1, "score": -1.5 }
        ]);
        assert_eq!(parse_rerank_response(&json, 3).unwrap(), vec![0.4, -1.5, 0.9]);
    }

    #[test]
    fn test_missing_or_stray_scores_error() {
        assert!(parse_rerank_response(&json!([{ "index": 0, "score": 0.1 }]), 2).is_err());
        assert!(parse_rerank_response(&json!([{ "index": 5, "score": 0.1 }]), 1).is_err());
        assert!(parse_rerank_response(&json!({ "error": "x" }), 1).is_err());
    }

    #[test]
    fn test_http_provider_requires_url() {
        let config = RerankConfig {
            provider: "http".to_string(),
            ..Default::default()
        };
        assert!(create_cross_encoder(&config).is_err());
        assert!(create_cross_encoder(&RerankConfig::default()).unwrap().is_none());
    }
}
