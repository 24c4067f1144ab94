//! Best-of-N generation.
//!
//! `n` attempts with stepped temperatures and rotating prompt framings run
//! through a bounded pool (`max_concurrency` in flight). A failed attempt
//! is excluded, never fatal, unless every attempt fails.

use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::prompt::PromptVariant;
use super::scoring::{QualityMetrics, ResponseScorer, ScoringMethod};
use super::{AnswerGenerator, GenerationParams, GenerationRequest};
use crate::error::{stage, PipelineError, Result};
use crate::text;

const VARIANTS: [PromptVariant; 3] = [PromptVariant::Standard, PromptVariant::Strict, PromptVariant::DroppedChunk];

const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BestOfNConfig {
    pub n: usize,
    pub max_concurrency: usize,
    pub base_temperature: f32,
    pub temperature_step: f32,
    pub scoring: ScoringMethod,
}

impl Default for BestOfNConfig {
    fn default() -> Self {
        Self {
            n: 5,
            max_concurrency: 3,
            base_temperature: 0.3,
            temperature_step: 0.15,
            scoring: ScoringMethod::RuleBased,
        }
    }
}

impl BestOfNConfig {
    /// Parameters for attempt `i`.
    pub fn params_for(&self, i: usize) -> GenerationParams {
        GenerationParams {
            temperature: (self.base_temperature + self.temperature_step * i as f32).clamp(0.0, 2.0),
            variant: VARIANTS[i % VARIANTS.len()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCandidate {
    pub response: String,
    pub generation_params: GenerationParams,
    pub confidence_score: f64,
    pub quality_metrics: QualityMetrics,
    pub generation_time_ms: u64,
    pub token_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestOfNResult {
    pub best: ResponseCandidate,
    pub generated: usize,
    pub failed: usize,
    pub mean_score: f64,
    /// `(best − mean) / mean`; zero when every candidate scored the same.
    pub quality_improvement: f64,
    pub scoring_method: ScoringMethod,
}

impl AnswerGenerator {
    pub async fn generate_best_of_n(
        &self,
        req: GenerationRequest<'_>,
        config: &BestOfNConfig,
        scorer: &ResponseScorer,
    ) -> Result<BestOfNResult> {
        let n = config.n.max(1);
        let cap = config.max_concurrency.max(1);

        let mut attempts: Vec<(usize, GenerationParams, Result<String>, u64)> = stream::iter(0..n)
            .map(|i| {
                let params = config.params_for(i);
                async move {
                    let started = Instant::now();
                    let outcome = self.complete(req, params, &[]).await;
                    (i, params, outcome, started.elapsed().as_millis() as u64)
                }
            })
            .buffer_unordered(cap)
            .collect()
            .await;
        attempts.sort_by_key(|(i, ..)| *i);

        let mut candidates = Vec::with_capacity(n);
        let mut last_error = None;
        for (i, params, outcome, elapsed_ms) in attempts {
            match outcome {
                Ok(response) => {
                    let (score, metrics) = scorer.score(&response, req.question, req.context).await;
                    candidates.push(ResponseCandidate {
                        token_count: text::estimate_tokens(&response),
                        response,
                        generation_params: params,
                        confidence_score: score,
                        quality_metrics: metrics,
                        generation_time_ms: elapsed_ms,
                    });
                }
                Err(e) => {
                    warn!(attempt = i, error = %e, "best-of-n candidate failed");
                    last_error = Some(e);
                }
            }
        }

        let failed = n - candidates.len();
        if candidates.is_empty() {
            return Err(last_error.unwrap_or_else(|| PipelineError::provider(stage::GENERATE, "no candidates generated")));
        }

        let mean_score = candidates.iter().map(|c| c.confidence_score).sum::<f64>() / candidates.len() as f64;
        let mut best_idx = 0;
        for (i, c) in candidates.iter().enumerate().skip(1) {
            if c.confidence_score > candidates[best_idx].confidence_score + SCORE_EPSILON {
                best_idx = i;
            }
        }
        let best = candidates.swap_remove(best_idx);
        let gain = best.confidence_score - mean_score;
        let quality_improvement = if gain > SCORE_EPSILON && mean_score > SCORE_EPSILON {
            gain / mean_score
        } else {
            0.0
        };

        debug!(
            generated = n - failed,
            failed,
            best = best.confidence_score,
            mean = mean_score,
            quality_improvement,
            "best-of-n complete"
        );

        Ok(BestOfNResult {
            best,
            generated: n - failed,
            failed,
            mean_score,
            quality_improvement,
            scoring_method: scorer.method(),
        })
    }
}
