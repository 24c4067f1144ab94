//! Cross-encoder reranking of retrieval candidates.
//!
//! Only the first `max_candidates` (default 15) inputs are sent to the
//! provider. Anything beyond that is appended after the reranked head with
//! its fused score rescaled to sit at or below the lowest head score.
//! Provider failures never fail retrieval: the original order and scores
//! come back unchanged.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{stage, PipelineError};
use crate::models::RetrievalResult;
use crate::providers::CrossEncoderProvider;

/// Raw outputs above this magnitude are treated as logits.
const LOGIT_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct Passage {
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankedPassage {
    pub content: String,
    pub score: f64,
    pub original_score: f64,
    /// Position in the input slice.
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankStatus {
    Applied,
    /// No cross-encoder configured, or nothing to rerank.
    Skipped,
    /// The provider failed; pre-rerank order kept.
    Failed,
}

/// Rescale a batch of raw cross-encoder outputs into `[0, 1]`.
///
/// When any score exceeds 2.0 in magnitude the batch is divided by its
/// largest magnitude; the result is clamped either way.
pub fn normalize_cross_encoder_scores(raw: &[f64]) -> Vec<f64> {
    let max_abs = raw.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    let scale = if max_abs > LOGIT_THRESHOLD { max_abs } else { 1.0 };
    raw.iter().map(|s| (s / scale).clamp(0.0, 1.0)).collect()
}

pub struct Reranker {
    provider: Option<Arc<dyn CrossEncoderProvider>>,
    max_candidates: usize,
}

impl Reranker {
    pub fn new(provider: Option<Arc<dyn CrossEncoderProvider>>, max_candidates: usize) -> Self {
        Self {
            provider,
            max_candidates: max_candidates.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, 15)
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Normalized scores for `contents`, or the reason there are none.
    async fn score_all(&self, query: &str, contents: &[String]) -> Result<Vec<f64>, RerankStatus> {
        let Some(provider) = &self.provider else {
            return Err(RerankStatus::Skipped);
        };
        if contents.is_empty() {
            return Err(RerankStatus::Skipped);
        }
        match provider.score_batch(query, contents).await {
            Ok(raw) if raw.len() == contents.len() => Ok(normalize_cross_encoder_scores(&raw)),
            Ok(raw) => {
                let err = PipelineError::provider(
                    stage::RERANK,
                    format!("expected {} scores, got {}", contents.len(), raw.len()),
                );
                warn!(error = %err, "reranker returned wrong score count, keeping original order");
                Err(RerankStatus::Failed)
            }
            Err(e) => {
                let err = PipelineError::provider(stage::RERANK, e);
                warn!(error = %err, "reranking failed, keeping original order");
                Err(RerankStatus::Failed)
            }
        }
    }

    /// Rerank plain passages. On failure the input order is returned with
    /// `score == original_score`.
    pub async fn rerank_passages(&self, query: &str, passages: &[Passage], top_k: usize) -> Vec<RerankedPassage> {
        let head = passages.len().min(self.max_candidates);
        let contents: Vec<String> = passages[..head].iter().map(|p| p.content.clone()).collect();

        let mut out: Vec<RerankedPassage> = match self.score_all(query, &contents).await {
            Ok(scores) => {
                let mut reranked: Vec<RerankedPassage> = passages[..head]
                    .iter()
                    .zip(scores)
                    .enumerate()
                    .map(|(i, (p, s))| RerankedPassage {
                        content: p.content.clone(),
                        score: s,
                        original_score: p.score,
                        index: i,
                    })
                    .collect();
                sort_desc(&mut reranked, |p| p.score);
                let floor = reranked.last().map_or(0.0, |p| p.score);
                let tail: Vec<f64> = passages[head..].iter().map(|p| p.score).collect();
                let scaled = scale_below(&tail, floor);
                reranked.extend(passages[head..].iter().zip(scaled).enumerate().map(|(i, (p, s))| {
                    RerankedPassage {
                        content: p.content.clone(),
                        score: s,
                        original_score: p.score,
                        index: head + i,
                    }
                }));
                reranked
            }
            Err(_) => passages
                .iter()
                .enumerate()
                .map(|(i, p)| RerankedPassage {
                    content: p.content.clone(),
                    score: p.score,
                    original_score: p.score,
                    index: i,
                })
                .collect(),
        };
        out.truncate(top_k);
        out
    }

    /// Rerank retrieval results, recording `original_score` and
    /// `rerank_score` in their metadata.
    pub async fn rerank(
        &self,
        query: &str,
        mut results: Vec<RetrievalResult>,
        top_k: usize,
    ) -> (Vec<RetrievalResult>, RerankStatus) {
        let head = results.len().min(self.max_candidates);
        let contents: Vec<String> = results[..head].iter().map(|r| r.content.clone()).collect();

        let status = match self.score_all(query, &contents).await {
            Ok(scores) => {
                let mut tail = results.split_off(head);
                for (r, s) in results.iter_mut().zip(scores) {
                    r.metadata.original_score = Some(r.score);
                    r.metadata.rerank_score = Some(s);
                    r.score = s;
                }
                sort_desc(&mut results, |r| r.score);
                let floor = results.last().map_or(0.0, |r| r.score);
                let fused: Vec<f64> = tail.iter().map(|r| r.score).collect();
                for (r, s) in tail.iter_mut().zip(scale_below(&fused, floor)) {
                    r.metadata.original_score = Some(r.score);
                    r.score = s;
                }
                results.extend(tail);
                debug!(reranked = head, "rerank applied");
                RerankStatus::Applied
            }
            Err(status) => status,
        };

        results.truncate(top_k);
        (results, status)
    }
}

fn sort_desc<T>(items: &mut [T], key: impl Fn(&T) -> f64) {
    items.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Map fused scores onto `[0, floor]`, keeping their order.
fn scale_below(scores: &[f64], floor: f64) -> Vec<f64> {
    let top = scores.iter().fold(0.0f64, |m, s| m.max(*s));
    if top <= 0.0 {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| (floor * s / top).clamp(0.0, floor.max(0.0))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResultMetadata;
    use anyhow::Result;
    use async_trait::async_trait;

    /// Scores passages by how many query words they contain, times `scale`.
    struct OverlapEncoder {
        scale: f64,
    }

    #[async_trait]
    impl CrossEncoderProvider for OverlapEncoder {
        async fn score(&self, query: &str, passage: &str) -> Result<f64> {
            let p = passage.to_lowercase();
            let hits = query.split_whitespace().filter(|w| p.contains(&w.to_lowercase())).count();
            Ok(hits as f64 * self.scale)
        }
    }

    struct BrokenEncoder;

    #[async_trait]
    impl CrossEncoderProvider for BrokenEncoder {
        async fn score(&self, _query: &str, _passage: &str) -> Result<f64> {
            anyhow::bail!("model not loaded")
        }
    }

    fn result(content: &str, score: f64) -> RetrievalResult {
        RetrievalResult {
            document_id: "d".into(),
            content: content.into(),
            score,
            chunk_index: 0,
            metadata: ResultMetadata::default(),
        }
    }

    #[test]
    fn test_normalize_probabilities_untouched() {
        assert_eq!(normalize_cross_encoder_scores(&[0.2, 0.9]), vec![0.2, 0.9]);
    }

    #[test]
    fn test_normalize_logits_divided_by_max() {
        let n = normalize_cross_encoder_scores(&[8.0, 4.0, -3.0]);
        assert_eq!(n, vec![1.0, 0.5, 0.0]);
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_records_original() {
        let reranker = Reranker::new(Some(Arc::new(OverlapEncoder { scale: 0.3 })), 15);
        let input = vec![result("unrelated text", 0.9), result("rust borrow checker", 0.4)];
        let (out, status) = reranker.rerank("rust borrow checker", input, 2).await;
        assert_eq!(status, RerankStatus::Applied);
        assert_eq!(out[0].content, "rust borrow checker");
        assert_eq!(out[0].metadata.original_score, Some(0.4));
        assert!((out[0].score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rerank_logits_rescaled() {
        let reranker = Reranker::new(Some(Arc::new(OverlapEncoder { scale: 5.0 })), 15);
        let passages = vec![
            Passage { content: "alpha beta".into(), score: 0.1 },
            Passage { content: "alpha".into(), score: 0.2 },
        ];
        let out = reranker.rerank_passages("alpha beta", &passages, 5).await;
        assert_eq!(out[0].score, 1.0);
        assert_eq!(out[1].score, 0.5);
        assert_eq!(out[1].original_score, 0.2);
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_original_order() {
        let reranker = Reranker::new(Some(Arc::new(BrokenEncoder)), 15);
        let input = vec![result("a", 0.9), result("b", 0.5), result("c", 0.1)];
        let (out, status) = reranker.rerank("q", input, 2).await;
        assert_eq!(status, RerankStatus::Failed);
        let contents: Vec<&str> = out.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
        assert_eq!(out[0].score, 0.9);
        assert!(out[0].metadata.rerank_score.is_none());
    }

    #[tokio::test]
    async fn test_only_head_is_reranked() {
        let reranker = Reranker::new(Some(Arc::new(OverlapEncoder { scale: 0.1 })), 2);
        let input = vec![result("x", 0.9), result("y", 0.8), result("q q", 0.7)];
        let (out, _) = reranker.rerank("q", input, 3).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].content, "q q");
        assert!(out[2].metadata.rerank_score.is_none());
        assert_eq!(out[2].metadata.original_score, Some(0.7));
    }

    #[tokio::test]
    async fn test_tail_scaled_below_reranked_head() {
        let reranker = Reranker::new(Some(Arc::new(OverlapEncoder { scale: 0.4 })), 2);
        let input = vec![
            result("borrow", 0.3),
            result("rust borrow", 0.2),
            result("tail one", 0.9),
            result("tail two", 0.45),
        ];
        let (out, status) = reranker.rerank("rust borrow", input, 4).await;
        assert_eq!(status, RerankStatus::Applied);
        assert_eq!(out[0].content, "rust borrow");
        assert!((out[1].score - 0.4).abs() < 1e-9);
        assert!((out[2].score - 0.4).abs() < 1e-9);
        assert!((out[3].score - 0.2).abs() < 1e-9);
        assert_eq!(out[3].metadata.original_score, Some(0.45));
    }

    #[tokio::test]
    async fn test_disabled_reranker_truncates() {
        let (out, status) = Reranker::disabled()
            .rerank("q", vec![result("a", 0.9), result("b", 0.5)], 1)
            .await;
        assert_eq!(status, RerankStatus::Skipped);
        assert_eq!(out.len(), 1);
    }
}
