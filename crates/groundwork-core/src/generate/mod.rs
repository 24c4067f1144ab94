//! Answer generation.
//!
//! [`AnswerGenerator`] renders a question-type-specific prompt from the
//! retrieved context and chat history, calls the [`GenerationProvider`]
//! and sanitizes the output. [`best_of_n`] runs several framings of the
//! same prompt concurrently and keeps the best-scoring one.

pub mod best_of_n;
pub mod prompt;
pub mod scoring;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{stage, PipelineError, Result};
use crate::models::{ChatMessage, RetrievalResult};
use crate::providers::GenerationProvider;
use crate::question::QuestionType;

pub use best_of_n::{BestOfNConfig, BestOfNResult, ResponseCandidate};
pub use prompt::{AnswerFormat, PromptVariant};
pub use scoring::{HybridWeights, QualityMetrics, ResponseScorer, ScoringMethod};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Most recent chat messages rendered into the prompt.
    pub history_turns: usize,
    pub max_context_chars: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.3,
            history_turns: 6,
            max_context_chars: 12_000,
        }
    }
}

/// Temperature and prompt framing for one generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub variant: PromptVariant,
}

/// One sanitized answer with a first-pass confidence estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftAnswer {
    pub text: String,
    pub confidence: f64,
    pub question_type: QuestionType,
    pub params: GenerationParams,
}

/// Question plus everything the prompt is rendered from.
#[derive(Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub context: &'a [RetrievalResult],
    pub history: &'a [ChatMessage],
    pub format: AnswerFormat,
}

pub struct AnswerGenerator {
    provider: Arc<dyn GenerationProvider>,
    config: GeneratorConfig,
}

impl AnswerGenerator {
    pub fn new(provider: Arc<dyn GenerationProvider>, config: GeneratorConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    fn default_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.config.temperature,
            variant: PromptVariant::Standard,
        }
    }

    /// Single-shot generation.
    pub async fn generate(&self, req: GenerationRequest<'_>) -> Result<DraftAnswer> {
        self.regenerate(req, &[]).await
    }

    /// Generate again with the problems of a previous draft spelled out.
    pub async fn regenerate(&self, req: GenerationRequest<'_>, improvements: &[String]) -> Result<DraftAnswer> {
        let params = self.default_params();
        let text = self.complete(req, params, improvements).await?;
        Ok(DraftAnswer {
            confidence: draft_confidence(&text, req.question, req.context),
            question_type: QuestionType::classify(req.question),
            text,
            params,
        })
    }

    /// Render, call the provider and sanitize. An empty answer is an error.
    pub(crate) async fn complete(
        &self,
        req: GenerationRequest<'_>,
        params: GenerationParams,
        improvements: &[String],
    ) -> Result<String> {
        let history_start = req.history.len().saturating_sub(self.config.history_turns);
        let rendered = prompt::build_prompt(&prompt::PromptInput {
            question: req.question,
            context: req.context,
            history: &req.history[history_start..],
            format: req.format,
            variant: params.variant,
            improvements,
            max_context_chars: self.config.max_context_chars,
        });
        debug!(
            model = self.provider.model_name(),
            prompt_chars = rendered.len(),
            temperature = params.temperature,
            variant = ?params.variant,
            "generating answer"
        );

        let raw = self
            .provider
            .generate(&rendered, self.config.max_tokens, params.temperature)
            .await
            .map_err(|e| PipelineError::provider(stage::GENERATE, e))?;
        let text = prompt::sanitize(&raw);
        if text.is_empty() {
            return Err(PipelineError::provider(stage::GENERATE, "empty completion"));
        }
        Ok(text)
    }
}

/// Half retrieval strength (mean of the top three context scores), half
/// rule-based answer quality.
pub fn draft_confidence(answer: &str, question: &str, context: &[RetrievalResult]) -> f64 {
    let top: Vec<f64> = context.iter().take(3).map(|r| r.score.clamp(0.0, 1.0)).collect();
    let retrieval = if top.is_empty() {
        0.0
    } else {
        top.iter().sum::<f64>() / top.len() as f64
    };
    (0.5 * retrieval + 0.5 * scoring::rule_based_score(answer, question)).clamp(0.0, 1.0)
}
