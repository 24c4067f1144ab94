//! Sentence-level support verification of an answer against its context.
//!
//! Each prose sentence is scored by its best embedding similarity to a
//! context passage (a verbatim occurrence scores 1.0). Sentences that come
//! close to the threshold are also scored by the cross-encoder, when one is
//! configured, and the two are fused. Unsupported sentences are removed
//! from the answer; fenced code blocks are passed through untouched.
//!
//! Filtering is a two-attempt strategy. If the strict pass removes more than
//! `max_word_loss` of the prose, a relaxed pass with a lower threshold is
//! used instead and a disclaimer is returned alongside the answer. The
//! disclaimer is not part of `filtered_answer`, so output shaping never
//! counts it against the sentence budget.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::{stage, PipelineError};
use crate::models::RetrievalResult;
use crate::providers::CrossEncoderProvider;
use crate::rerank::normalize_cross_encoder_scores;
use crate::text;

pub const RELAXED_DISCLAIMER: &str =
    "Note: some statements in this answer could only be verified against the sources with relaxed checks.";

pub const UNVERIFIED_DISCLAIMER: &str =
    "Note: the statements in this answer could not be verified against the sources.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactCheckConfig {
    pub support_threshold: f64,
    /// Cross-encoder scoring kicks in above `gate × support_threshold`.
    pub cross_encoder_gate: f64,
    pub semantic_weight: f64,
    pub cross_encoder_weight: f64,
    /// Passages sent to the cross-encoder per sentence.
    pub cross_encoder_top_chunks: usize,
    pub max_word_loss: f64,
    pub relaxed_step: f64,
    pub relaxed_floor: f64,
    pub min_sentence_chars: usize,
    pub min_sentence_words: usize,
}

impl Default for FactCheckConfig {
    fn default() -> Self {
        Self {
            support_threshold: 0.6,
            cross_encoder_gate: 0.8,
            semantic_weight: 0.4,
            cross_encoder_weight: 0.6,
            cross_encoder_top_chunks: 3,
            max_word_loss: 0.7,
            relaxed_step: 0.2,
            relaxed_floor: 0.4,
            min_sentence_chars: 20,
            min_sentence_words: 4,
        }
    }
}

impl FactCheckConfig {
    pub fn relaxed_threshold(&self) -> f64 {
        self.relaxed_floor.max(self.support_threshold - self.relaxed_step)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentenceVerification {
    pub sentence: String,
    pub is_supported: bool,
    /// Fused support score.
    pub confidence: f64,
    pub semantic_score: f64,
    pub cross_encoder_score: Option<f64>,
    /// Chunk ids (or `#index` when a result carries no id) of the best matches.
    pub supporting_chunks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    Strict,
    /// Strict filtering lost too much; the lower threshold was used.
    Relaxed,
    /// Nothing passed even the relaxed threshold; the answer is kept whole.
    Unfiltered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckResult {
    pub original_answer: String,
    pub verified_sentences: Vec<SentenceVerification>,
    pub filtered_answer: String,
    /// Set in relaxed and unfiltered mode. Must be shown with the answer.
    pub disclaimer: Option<String>,
    /// Mean fused score across verified sentences.
    pub overall_support_score: f64,
    pub confidence_score: f64,
    pub num_supported_sentences: usize,
    pub num_total_sentences: usize,
    pub support_ratio: f64,
    pub verification_mode: VerificationMode,
    pub threshold_used: f64,
}

impl FactCheckResult {
    pub fn summary(&self) -> FactCheckSummary {
        FactCheckSummary {
            supported: self.num_supported_sentences,
            total: self.num_total_sentences,
            support_ratio: self.support_ratio,
            confidence: self.confidence_score,
            mode: self.verification_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckSummary {
    pub supported: usize,
    pub total: usize,
    pub support_ratio: f64,
    pub confidence: f64,
    pub mode: VerificationMode,
}

/// `0.7 × ratio^0.8 + 0.3 × support + max(0, support − 0.7) × 0.5`, clamped.
pub fn fact_check_confidence(support_ratio: f64, overall_support: f64) -> f64 {
    let bonus = (overall_support - 0.7).max(0.0) * 0.5;
    (0.7 * support_ratio.powf(0.8) + 0.3 * overall_support + bonus).clamp(0.0, 1.0)
}

pub struct FactChecker {
    embedder: Arc<dyn EmbeddingProvider>,
    cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
    config: FactCheckConfig,
}

struct Scored {
    sentence: String,
    semantic: f64,
    cross_encoder: Option<f64>,
    fused: f64,
    supporting: Vec<String>,
}

impl FactChecker {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
        config: FactCheckConfig,
    ) -> Self {
        Self {
            embedder,
            cross_encoder,
            config,
        }
    }

    pub fn config(&self) -> &FactCheckConfig {
        &self.config
    }

    pub async fn check(&self, answer: &str, context: &[RetrievalResult], question: Option<&str>) -> FactCheckResult {
        let (prose, code_blocks) = text::split_code_fences(answer);
        let sentences: Vec<String> = text::split_sentences(&prose)
            .into_iter()
            .filter(|s| s.len() >= self.config.min_sentence_chars && text::word_count(s) >= self.config.min_sentence_words)
            .collect();

        let scored = self.score_sentences(&sentences, context).await;
        let overall_support = if scored.is_empty() {
            0.0
        } else {
            scored.iter().map(|s| s.fused).sum::<f64>() / scored.len() as f64
        };

        let prose_words = text::word_count(&prose);
        let strict = self.config.support_threshold;
        let mut threshold = strict;
        let mut mode = VerificationMode::Strict;
        let mut kept = supported_text(&scored, threshold);

        if prose_words > 0 && !scored.is_empty() {
            let loss = 1.0 - text::word_count(&kept) as f64 / prose_words as f64;
            if loss > self.config.max_word_loss {
                threshold = self.config.relaxed_threshold();
                kept = supported_text(&scored, threshold);
                mode = if kept.is_empty() {
                    VerificationMode::Unfiltered
                } else {
                    VerificationMode::Relaxed
                };
                debug!(loss, relaxed_threshold = threshold, mode = ?mode, "fact check safety valve");
            }
        }

        let (filtered_answer, disclaimer) = match mode {
            VerificationMode::Strict if scored.is_empty() => (answer.trim().to_string(), None),
            VerificationMode::Strict => (with_code(&kept, &code_blocks), None),
            VerificationMode::Relaxed => (with_code(&kept, &code_blocks), Some(RELAXED_DISCLAIMER)),
            VerificationMode::Unfiltered => (answer.trim().to_string(), Some(UNVERIFIED_DISCLAIMER)),
        };

        let verified_sentences: Vec<SentenceVerification> = scored
            .into_iter()
            .map(|s| SentenceVerification {
                is_supported: s.fused >= threshold,
                confidence: s.fused,
                semantic_score: s.semantic,
                cross_encoder_score: s.cross_encoder,
                supporting_chunks: s.supporting,
                sentence: s.sentence,
            })
            .collect();
        let num_total_sentences = verified_sentences.len();
        let num_supported_sentences = verified_sentences.iter().filter(|v| v.is_supported).count();
        let support_ratio = if num_total_sentences == 0 {
            0.0
        } else {
            num_supported_sentences as f64 / num_total_sentences as f64
        };

        debug!(
            question = question.unwrap_or(""),
            supported = num_supported_sentences,
            total = num_total_sentences,
            support_ratio,
            "fact check complete"
        );

        FactCheckResult {
            original_answer: answer.to_string(),
            verified_sentences,
            filtered_answer,
            disclaimer: disclaimer.map(str::to_string),
            overall_support_score: overall_support,
            confidence_score: fact_check_confidence(support_ratio, overall_support),
            num_supported_sentences,
            num_total_sentences,
            support_ratio,
            verification_mode: mode,
            threshold_used: threshold,
        }
    }

    async fn score_sentences(&self, sentences: &[String], context: &[RetrievalResult]) -> Vec<Scored> {
        if sentences.is_empty() {
            return Vec::new();
        }
        let normalized_context: Vec<String> = context.iter().map(|r| text::normalize(&r.content)).collect();
        let similarities = self.similarity_matrix(sentences, context).await;
        let gate = self.config.cross_encoder_gate * self.config.support_threshold;

        let mut out = Vec::with_capacity(sentences.len());
        for (i, sentence) in sentences.iter().enumerate() {
            let row = &similarities[i];
            let mut ranked: Vec<usize> = (0..context.len()).collect();
            ranked.sort_by(|a, b| row[*b].partial_cmp(&row[*a]).unwrap_or(std::cmp::Ordering::Equal));

            let needle = text::normalize(sentence);
            let needle = needle.trim_end_matches(['.', '!', '?']);
            let verbatim = normalized_context.iter().position(|c| !needle.is_empty() && c.contains(needle));

            let semantic = match verbatim {
                Some(_) => 1.0,
                None => ranked.first().map(|&j| row[j]).unwrap_or(0.0),
            };

            let top: Vec<usize> = ranked.iter().copied().take(self.config.cross_encoder_top_chunks.max(1)).collect();
            let mut supporting: Vec<String> = Vec::new();
            if let Some(j) = verbatim {
                supporting.push(chunk_label(&context[j], j));
            }
            for &j in &top {
                if row[j] >= gate && verbatim != Some(j) {
                    supporting.push(chunk_label(&context[j], j));
                }
            }

            let cross_encoder = if verbatim.is_none() && semantic > gate {
                self.cross_encode(sentence, context, &top).await
            } else {
                None
            };
            let fused = match cross_encoder {
                Some(ce) => self.config.semantic_weight * semantic + self.config.cross_encoder_weight * ce,
                None => semantic,
            };

            out.push(Scored {
                sentence: sentence.clone(),
                semantic,
                cross_encoder,
                fused: fused.clamp(0.0, 1.0),
                supporting,
            });
        }
        out
    }

    /// `[sentence][chunk]` similarities in `[0, 1]`. Falls back to lexical
    /// overlap when embedding fails.
    async fn similarity_matrix(&self, sentences: &[String], context: &[RetrievalResult]) -> Vec<Vec<f64>> {
        if context.is_empty() {
            return vec![Vec::new(); sentences.len()];
        }
        let mut inputs: Vec<String> = sentences.to_vec();
        inputs.extend(context.iter().map(|r| r.content.clone()));

        match self.embedder.embed(&inputs).await {
            Ok(vectors) if vectors.len() == inputs.len() => {
                let (sentence_vecs, chunk_vecs) = vectors.split_at(sentences.len());
                sentence_vecs
                    .iter()
                    .map(|s| {
                        chunk_vecs
                            .iter()
                            .map(|c| (cosine_similarity(s, c) as f64).clamp(0.0, 1.0))
                            .collect()
                    })
                    .collect()
            }
            outcome => {
                let err = match outcome {
                    Err(e) => PipelineError::provider(stage::FACT_CHECK, e),
                    Ok(v) => PipelineError::provider(stage::FACT_CHECK, format!("expected {} vectors, got {}", inputs.len(), v.len())),
                };
                warn!(error = %err, "fact check embedding failed, using lexical similarity");
                sentences
                    .iter()
                    .map(|s| context.iter().map(|r| text::lexical_similarity(s, &r.content)).collect())
                    .collect()
            }
        }
    }

    async fn cross_encode(&self, sentence: &str, context: &[RetrievalResult], top: &[usize]) -> Option<f64> {
        let provider = self.cross_encoder.as_ref()?;
        let passages: Vec<String> = top.iter().map(|&j| context[j].content.clone()).collect();
        match provider.score_batch(sentence, &passages).await {
            Ok(raw) if !raw.is_empty() => normalize_cross_encoder_scores(&raw)
                .into_iter()
                .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s)))),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %PipelineError::provider(stage::FACT_CHECK, e), "cross-encoder verification failed");
                None
            }
        }
    }
}

fn chunk_label(result: &RetrievalResult, index: usize) -> String {
    if result.metadata.chunk_id.is_empty() {
        format!("#{}", index)
    } else {
        result.metadata.chunk_id.clone()
    }
}

fn supported_text(scored: &[Scored], threshold: f64) -> String {
    scored
        .iter()
        .filter(|s| s.fused >= threshold)
        .map(|s| s.sentence.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn with_code(prose: &str, code_blocks: &[String]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if !prose.is_empty() {
        parts.push(prose);
    }
    parts.extend(code_blocks.iter().map(String::as_str));
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::models::ResultMetadata;
    use anyhow::Result;
    use async_trait::async_trait;

    fn ctx(id: &str, content: &str) -> RetrievalResult {
        RetrievalResult {
            document_id: "d".into(),
            content: content.into(),
            score: 0.8,
            chunk_index: 0,
            metadata: ResultMetadata {
                chunk_id: id.into(),
                ..Default::default()
            },
        }
    }

    fn checker() -> FactChecker {
        FactChecker::new(Arc::new(HashingEmbedder::new(512)), None, FactCheckConfig::default())
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        fn model_name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("model not loaded")
        }
    }

    struct ConstantEncoder(f64);

    #[async_trait]
    impl CrossEncoderProvider for ConstantEncoder {
        async fn score(&self, _query: &str, _passage: &str) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_verbatim_sentence_is_supported() {
        let context = vec![ctx("c1", "TypeScript is a language. It compiles to JavaScript.")];
        let result = checker().check("TypeScript is a language.", &context, None).await;
        assert_eq!(result.num_total_sentences, 1);
        assert_eq!(result.num_supported_sentences, 1);
        assert_eq!(result.support_ratio, 1.0);
        assert_eq!(result.verified_sentences[0].semantic_score, 1.0);
        assert_eq!(result.verified_sentences[0].supporting_chunks, vec!["c1".to_string()]);
        assert_eq!(result.filtered_answer, "TypeScript is a language.");
        assert_eq!(result.verification_mode, VerificationMode::Strict);
    }

    #[tokio::test]
    async fn test_short_fragments_are_ignored() {
        let result = checker().check("Yes. Rust is fast.", &[ctx("c", "Rust is fast.")], None).await;
        assert_eq!(result.num_total_sentences, 0);
        assert_eq!(result.support_ratio, 0.0);
        assert_eq!(result.filtered_answer, "Yes. Rust is fast.");
    }

    #[tokio::test]
    async fn test_unsupported_sentence_removed() {
        let context = vec![ctx(
            "c",
            "Cargo is the Rust package manager. Cargo downloads dependencies and builds packages.",
        )];
        let answer = "Cargo is the Rust package manager. Cargo downloads dependencies and builds packages. \
                      Penguins migrate across frozen Antarctic ice shelves.";
        let result = checker().check(answer, &context, Some("What is cargo?")).await;
        assert_eq!(result.num_total_sentences, 3);
        assert_eq!(result.num_supported_sentences, 2);
        assert!(!result.filtered_answer.contains("Penguins"));
        assert!(result.disclaimer.is_none());
        assert!((result.support_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_safety_valve_keeps_answer_with_disclaimer() {
        let context = vec![ctx("c", "Closures capture variables from the enclosing scope.")];
        let answer = "Penguins migrate across frozen Antarctic ice shelves every winter season.";
        let result = checker().check(answer, &context, None).await;
        assert_eq!(result.verification_mode, VerificationMode::Unfiltered);
        assert_eq!(result.filtered_answer, answer);
        assert_eq!(result.disclaimer.as_deref(), Some(UNVERIFIED_DISCLAIMER));
        assert_eq!(result.support_ratio, 0.0);
        assert!((result.threshold_used - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_code_blocks_pass_through() {
        let context = vec![ctx("c", "Use the add function to sum two integers together.")];
        let answer = "Use the add function to sum two integers together.\n```rust\nfn add(a: i32, b: i32) -> i32 { a + b }\n```";
        let result = checker().check(answer, &context, None).await;
        assert_eq!(result.num_total_sentences, 1);
        assert!(result.filtered_answer.contains("fn add(a: i32, b: i32)"));
        assert!(result.filtered_answer.starts_with("Use the add function"));
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_lexical() {
        let checker = FactChecker::new(Arc::new(BrokenEmbedder), None, FactCheckConfig::default());
        let context = vec![ctx("c", "Tokio schedules asynchronous tasks on worker threads.")];
        let result = checker
            .check("Tokio schedules many asynchronous tasks on worker threads.", &context, None)
            .await;
        assert_eq!(result.num_total_sentences, 1);
        assert!(result.verified_sentences[0].semantic_score > 0.6);
        assert_eq!(result.num_supported_sentences, 1);
    }

    #[tokio::test]
    async fn test_cross_encoder_fusion() {
        let checker = FactChecker::new(
            Arc::new(BrokenEmbedder),
            Some(Arc::new(ConstantEncoder(0.0))),
            FactCheckConfig::default(),
        );
        let context = vec![ctx("c", "Tokio schedules asynchronous tasks on worker threads.")];
        let result = checker
            .check("Tokio schedules many asynchronous tasks on worker threads.", &context, None)
            .await;
        let v = &result.verified_sentences[0];
        assert_eq!(v.cross_encoder_score, Some(0.0));
        assert!((v.confidence - 0.4 * v.semantic_score).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_formula() {
        assert!((fact_check_confidence(1.0, 1.0) - 1.0).abs() < 1e-9);
        assert_eq!(fact_check_confidence(0.0, 0.0), 0.0);
        let c = fact_check_confidence(0.5, 0.6);
        assert!((c - (0.7 * 0.5f64.powf(0.8) + 0.18)).abs() < 1e-9);
    }

    #[test]
    fn test_relaxed_threshold_floor() {
        let config = FactCheckConfig {
            support_threshold: 0.5,
            ..Default::default()
        };
        assert!((config.relaxed_threshold() - 0.4).abs() < 1e-9);
        assert!((FactCheckConfig::default().relaxed_threshold() - 0.4).abs() < 1e-9);
    }
}
