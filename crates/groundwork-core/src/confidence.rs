//! Multi-signal answer confidence.
//!
//! Eight signals in `[0, 1]` are combined with configurable weights. Risk
//! factors are detected independently; their penalties are summed and
//! damped by `base^max(0, count − free_risks)` before being subtracted.
//! Whether the answer should be used is a dual gate on the penalized
//! confidence and the number of risks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::factcheck::FactCheckResult;
use crate::generate::scoring::rule_based_score;
use crate::models::RetrievalResult;
use crate::text;
use crate::validate::ValidationResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub retrieval: f64,
    pub reranker: f64,
    pub semantic_consistency: f64,
    pub context_coverage: f64,
    pub fact_check: f64,
    pub response_quality: f64,
    pub query_specificity: f64,
    pub answer_completeness: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            retrieval: 0.18,
            reranker: 0.20,
            semantic_consistency: 0.15,
            context_coverage: 0.15,
            fact_check: 0.20,
            response_quality: 0.12,
            query_specificity: 0.0,
            answer_completeness: 0.0,
        }
    }
}

impl SignalWeights {
    pub fn as_pairs(&self) -> [(&'static str, f64); 8] {
        [
            ("retrieval_score", self.retrieval),
            ("reranker_score", self.reranker),
            ("semantic_consistency", self.semantic_consistency),
            ("context_coverage", self.context_coverage),
            ("fact_check_score", self.fact_check),
            ("response_quality", self.response_quality),
            ("query_specificity", self.query_specificity),
            ("answer_completeness", self.answer_completeness),
        ]
    }
}

/// Lower edges of the low / medium / high / very-high levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelBands {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub very_high: f64,
}

impl Default for LevelBands {
    fn default() -> Self {
        Self {
            low: 0.3,
            medium: 0.5,
            high: 0.7,
            very_high: 0.85,
        }
    }
}

/// Upper edges of the refuse / partial / cautious fallback bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackBands {
    pub refuse: f64,
    pub partial: f64,
    pub cautious: f64,
}

impl Default for FallbackBands {
    fn default() -> Self {
        Self {
            refuse: 0.3,
            partial: 0.5,
            cautious: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub weights: SignalWeights,
    pub strict_threshold: f64,
    pub max_risks: usize,
    pub risk_damping_base: f64,
    /// Risks that are penalized in full before damping starts.
    pub free_risks: usize,
    pub levels: LevelBands,
    pub fallback: FallbackBands,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            strict_threshold: 0.6,
            max_risks: 2,
            risk_damping_base: 0.8,
            free_risks: 3,
            levels: LevelBands::default(),
            fallback: FallbackBands::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSignals {
    pub retrieval_score: f64,
    pub reranker_score: f64,
    pub semantic_consistency: f64,
    pub context_coverage: f64,
    pub fact_check_score: f64,
    pub response_quality: f64,
    pub query_specificity: f64,
    pub answer_completeness: f64,
}

impl ConfidenceSignals {
    fn values(&self) -> [f64; 8] {
        [
            self.retrieval_score,
            self.reranker_score,
            self.semantic_consistency,
            self.context_coverage,
            self.fact_check_score,
            self.response_quality,
            self.query_specificity,
            self.answer_completeness,
        ]
    }

    fn clamped(mut self) -> Self {
        for v in [
            &mut self.retrieval_score,
            &mut self.reranker_score,
            &mut self.semantic_consistency,
            &mut self.context_coverage,
            &mut self.fact_check_score,
            &mut self.response_quality,
            &mut self.query_specificity,
            &mut self.answer_completeness,
        ] {
            *v = if v.is_finite() { (*v).clamp(0.0, 1.0) } else { 0.0 };
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::VeryLow => "very_low",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
            ConfidenceLevel::VeryHigh => "very_high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    PoorRetrieval,
    LowSemanticConsistency,
    InsufficientContextUsage,
    FactCheckFailure,
    LowResponseQuality,
    AnswerTooBrief,
    ContainsHedging,
    InsufficientContext,
}

impl RiskFactor {
    pub fn penalty(&self) -> f64 {
        match self {
            RiskFactor::PoorRetrieval => 0.15,
            RiskFactor::LowSemanticConsistency => 0.15,
            RiskFactor::InsufficientContextUsage => 0.10,
            RiskFactor::FactCheckFailure => 0.20,
            RiskFactor::LowResponseQuality => 0.10,
            RiskFactor::AnswerTooBrief => 0.05,
            RiskFactor::ContainsHedging => 0.05,
            RiskFactor::InsufficientContext => 0.10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFactor::PoorRetrieval => "poor_retrieval",
            RiskFactor::LowSemanticConsistency => "low_semantic_consistency",
            RiskFactor::InsufficientContextUsage => "insufficient_context_usage",
            RiskFactor::FactCheckFailure => "fact_check_failure",
            RiskFactor::LowResponseQuality => "low_response_quality",
            RiskFactor::AnswerTooBrief => "answer_too_brief",
            RiskFactor::ContainsHedging => "contains_hedging",
            RiskFactor::InsufficientContext => "insufficient_context",
        }
    }
}

/// Confidence-banded presentation of the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Refuse,
    PartialWithDisclaimer,
    Cautious,
    FullAnswer,
}

pub const REFUSAL_MESSAGE: &str =
    "I don't have enough reliable information to answer this question confidently.";

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::Refuse => "refuse",
            FallbackStrategy::PartialWithDisclaimer => "partial_with_disclaimer",
            FallbackStrategy::Cautious => "cautious",
            FallbackStrategy::FullAnswer => "full_answer",
        }
    }

    /// Apply the strategy's message template.
    pub fn render(&self, answer: &str) -> String {
        let answer = answer.trim();
        match self {
            FallbackStrategy::Refuse => REFUSAL_MESSAGE.to_string(),
            FallbackStrategy::PartialWithDisclaimer => format!(
                "I could only find partial information on this, so parts of the answer may be incomplete.\n\n{}",
                answer
            ),
            FallbackStrategy::Cautious => format!(
                "{}\n\nThis answer rests on limited information; please verify important details.",
                answer
            ),
            FallbackStrategy::FullAnswer => answer.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    /// Weighted contribution of each signal.
    pub contributions: BTreeMap<String, f64>,
    pub weighted_sum: f64,
    pub raw_penalty: f64,
    pub damping_factor: f64,
    pub risk_penalty: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceResult {
    pub overall_confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub signals: ConfidenceSignals,
    pub risk_factors: Vec<RiskFactor>,
    pub reliability_score: f64,
    pub should_use_answer: bool,
    pub fallback_recommendation: FallbackStrategy,
    pub confidence_breakdown: ConfidenceBreakdown,
}

/// Facts about the answer and context that feed risk detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerObservations {
    pub answer_words: usize,
    pub context_words: usize,
    pub hedging: bool,
}

impl AnswerObservations {
    pub fn of(answer: &str, context: &[RetrievalResult]) -> Self {
        Self {
            answer_words: text::word_count(answer),
            context_words: context.iter().map(|r| text::word_count(&r.content)).sum(),
            hedging: text::contains_hedging(answer),
        }
    }
}

/// Everything [`ConfidenceScorer::score`] derives its signals from.
pub struct ConfidenceInput<'a> {
    pub query: &'a str,
    pub answer: &'a str,
    pub context: &'a [RetrievalResult],
    pub retrieval_scores: &'a [f64],
    pub reranker_scores: Option<&'a [f64]>,
    pub fact_check: Option<&'a FactCheckResult>,
    pub validation: Option<&'a ValidationResult>,
}

pub struct ConfidenceScorer {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: ConfidenceConfig,
}

const NEUTRAL_SIGNAL: f64 = 0.5;

fn top_mean(scores: &[f64], k: usize) -> f64 {
    let mut sorted: Vec<f64> = scores.iter().map(|s| s.clamp(0.0, 1.0)).collect();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    sorted.truncate(k);
    if sorted.is_empty() {
        0.0
    } else {
        sorted.iter().sum::<f64>() / sorted.len() as f64
    }
}

impl ConfidenceScorer {
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, config: ConfidenceConfig) -> Self {
        Self { embedder, config }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    pub async fn score(&self, input: &ConfidenceInput<'_>) -> ConfidenceResult {
        let signals = self.signals(input).await;
        self.assess(signals, AnswerObservations::of(input.answer, input.context))
    }

    /// Compute the eight signals for one answer.
    pub async fn signals(&self, input: &ConfidenceInput<'_>) -> ConfidenceSignals {
        let retrieval_score = top_mean(input.retrieval_scores, 3);
        let reranker_score = match input.reranker_scores {
            Some(scores) if !scores.is_empty() => top_mean(scores, 3),
            _ => retrieval_score,
        };

        let context_text: String = input
            .context
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let context_words = text::content_words(&context_text);
        let context_coverage = text::coverage(input.answer, &context_words);

        let fact_check_score = input.fact_check.map_or(NEUTRAL_SIGNAL, |f| f.confidence_score);

        let rule = rule_based_score(input.answer, input.query);
        let response_quality = match input.validation {
            Some(v) => 0.5 * rule + 0.5 * v.score,
            None => rule,
        };

        let query_terms = text::content_words(input.query).len();
        let query_specificity = (query_terms as f64 / 6.0).min(1.0);
        let answer_completeness = text::coverage(input.query, &text::content_words(input.answer));

        let semantic_consistency = self
            .semantic_consistency(input.query, input.answer, input.context)
            .await
            .unwrap_or(context_coverage);

        ConfidenceSignals {
            retrieval_score,
            reranker_score,
            semantic_consistency,
            context_coverage,
            fact_check_score,
            response_quality,
            query_specificity,
            answer_completeness,
        }
        .clamped()
    }

    /// `0.6 × best answer/passage cosine + 0.4 × answer/query cosine`.
    async fn semantic_consistency(&self, query: &str, answer: &str, context: &[RetrievalResult]) -> Option<f64> {
        let embedder = self.embedder.as_ref()?;
        if answer.trim().is_empty() {
            return Some(0.0);
        }
        let mut inputs = vec![answer.to_string(), query.to_string()];
        inputs.extend(context.iter().take(5).map(|r| r.content.clone()));
        match embedder.embed(&inputs).await {
            Ok(vectors) if vectors.len() == inputs.len() => {
                let answer_vec = &vectors[0];
                let to_query = (cosine_similarity(answer_vec, &vectors[1]) as f64).clamp(0.0, 1.0);
                let to_context = vectors[2..]
                    .iter()
                    .map(|v| (cosine_similarity(answer_vec, v) as f64).clamp(0.0, 1.0))
                    .fold(0.0f64, f64::max);
                Some(0.6 * to_context + 0.4 * to_query)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "semantic consistency embedding failed, using lexical coverage");
                None
            }
        }
    }

    /// Combine signals and risks into the final result.
    pub fn assess(&self, signals: ConfidenceSignals, obs: AnswerObservations) -> ConfidenceResult {
        let signals = signals.clamped();
        let weights = self.config.weights.as_pairs();
        let values = signals.values();

        let mut contributions = BTreeMap::new();
        let mut weighted_sum = 0.0;
        for ((name, w), v) in weights.iter().zip(values.iter()) {
            let c = w * v;
            contributions.insert(name.to_string(), c);
            weighted_sum += c;
        }

        let risk_factors = self.detect_risks(&signals, obs);
        let raw_penalty: f64 = risk_factors.iter().map(|r| r.penalty()).sum();
        let excess = risk_factors.len().saturating_sub(self.config.free_risks) as i32;
        let damping_factor = self.config.risk_damping_base.powi(excess);
        let risk_penalty = raw_penalty * damping_factor;

        let overall_confidence = (weighted_sum - risk_penalty).clamp(0.0, 1.0);

        let weighted: Vec<f64> = weights
            .iter()
            .zip(values.iter())
            .filter(|((_, w), _)| *w > 0.0)
            .map(|(_, v)| *v)
            .collect();
        let spread = match (
            weighted.iter().cloned().fold(f64::NAN, f64::max),
            weighted.iter().cloned().fold(f64::NAN, f64::min),
        ) {
            (max, min) if max.is_finite() && min.is_finite() => max - min,
            _ => 0.0,
        };
        let reliability_score = ((1.0 - spread) * (1.0 - 0.1 * risk_factors.len() as f64)).clamp(0.0, 1.0);

        let should_use_answer =
            overall_confidence >= self.config.strict_threshold && risk_factors.len() <= self.config.max_risks;

        debug!(
            confidence = overall_confidence,
            risks = risk_factors.len(),
            should_use_answer,
            "confidence assessed"
        );

        ConfidenceResult {
            overall_confidence,
            confidence_level: self.level_for(overall_confidence),
            signals,
            reliability_score,
            should_use_answer,
            fallback_recommendation: self.fallback_for(overall_confidence),
            confidence_breakdown: ConfidenceBreakdown {
                contributions,
                weighted_sum,
                raw_penalty,
                damping_factor,
                risk_penalty,
                final_score: overall_confidence,
            },
            risk_factors,
        }
    }

    fn detect_risks(&self, s: &ConfidenceSignals, obs: AnswerObservations) -> Vec<RiskFactor> {
        let checks = [
            (s.retrieval_score < 0.4, RiskFactor::PoorRetrieval),
            (s.semantic_consistency < 0.3, RiskFactor::LowSemanticConsistency),
            (s.context_coverage < 0.4, RiskFactor::InsufficientContextUsage),
            (s.fact_check_score < 0.4, RiskFactor::FactCheckFailure),
            (s.response_quality < 0.5, RiskFactor::LowResponseQuality),
            (obs.answer_words < 15, RiskFactor::AnswerTooBrief),
            (obs.hedging, RiskFactor::ContainsHedging),
            (obs.context_words < 50, RiskFactor::InsufficientContext),
        ];
        checks.into_iter().filter(|(hit, _)| *hit).map(|(_, r)| r).collect()
    }

    pub fn level_for(&self, confidence: f64) -> ConfidenceLevel {
        let b = &self.config.levels;
        if confidence < b.low {
            ConfidenceLevel::VeryLow
        } else if confidence < b.medium {
            ConfidenceLevel::Low
        } else if confidence < b.high {
            ConfidenceLevel::Medium
        } else if confidence < b.very_high {
            ConfidenceLevel::High
        } else {
            ConfidenceLevel::VeryHigh
        }
    }

    /// Band lookup used again after merging changes the confidence.
    pub fn fallback_for(&self, confidence: f64) -> FallbackStrategy {
        let b = &self.config.fallback;
        if confidence < b.refuse {
            FallbackStrategy::Refuse
        } else if confidence < b.partial {
            FallbackStrategy::PartialWithDisclaimer
        } else if confidence < b.cautious {
            FallbackStrategy::Cautious
        } else {
            FallbackStrategy::FullAnswer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::models::ResultMetadata;

    fn uniform(v: f64) -> ConfidenceSignals {
        ConfidenceSignals {
            retrieval_score: v,
            reranker_score: v,
            semantic_consistency: v,
            context_coverage: v,
            fact_check_score: v,
            response_quality: v,
            query_specificity: v,
            answer_completeness: v,
        }
    }

    fn healthy() -> AnswerObservations {
        AnswerObservations {
            answer_words: 80,
            context_words: 400,
            hedging: false,
        }
    }

    fn scorer() -> ConfidenceScorer {
        ConfidenceScorer::new(None, ConfidenceConfig::default())
    }

    #[test]
    fn test_high_signals_full_answer() {
        let r = scorer().assess(uniform(0.9), healthy());
        assert!(r.risk_factors.is_empty());
        assert!((r.overall_confidence - 0.9).abs() < 1e-9);
        assert!(r.should_use_answer);
        assert_eq!(r.fallback_recommendation, FallbackStrategy::FullAnswer);
        assert_eq!(r.confidence_level, ConfidenceLevel::VeryHigh);
        assert_eq!(r.confidence_breakdown.final_score, r.overall_confidence);
        assert!((r.reliability_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_risk_damping_beyond_three() {
        let obs = AnswerObservations {
            answer_words: 5,
            context_words: 10,
            hedging: true,
        };
        let r = scorer().assess(uniform(0.1), obs);
        assert_eq!(r.risk_factors.len(), 8);
        let raw: f64 = r.risk_factors.iter().map(|f| f.penalty()).sum();
        assert!((r.confidence_breakdown.damping_factor - 0.8f64.powi(5)).abs() < 1e-12);
        assert!((r.confidence_breakdown.risk_penalty - raw * 0.8f64.powi(5)).abs() < 1e-12);
        assert_eq!(r.overall_confidence, 0.0);
        assert!(!r.should_use_answer);
        assert_eq!(r.fallback_recommendation, FallbackStrategy::Refuse);
    }

    #[test]
    fn test_dual_gate_blocks_many_risks() {
        let obs = AnswerObservations {
            answer_words: 5,
            context_words: 10,
            hedging: true,
        };
        let config = ConfidenceConfig {
            strict_threshold: 0.0,
            ..Default::default()
        };
        let r = ConfidenceScorer::new(None, config).assess(uniform(1.0), obs);
        assert_eq!(r.risk_factors.len(), 3);
        assert!(!r.should_use_answer);
    }

    #[test]
    fn test_gate_monotone_in_confidence() {
        let s = scorer();
        let mut seen_true = false;
        for i in 0..=100 {
            let r = s.assess(uniform(i as f64 / 100.0), healthy());
            if seen_true {
                assert!(r.should_use_answer, "gate flipped back at {}", i);
            }
            seen_true |= r.should_use_answer;
        }
        assert!(seen_true);
    }

    #[test]
    fn test_bands() {
        let s = scorer();
        assert_eq!(s.fallback_for(0.29), FallbackStrategy::Refuse);
        assert_eq!(s.fallback_for(0.3), FallbackStrategy::PartialWithDisclaimer);
        assert_eq!(s.fallback_for(0.5), FallbackStrategy::Cautious);
        assert_eq!(s.fallback_for(0.7), FallbackStrategy::FullAnswer);
        assert_eq!(s.level_for(0.0), ConfidenceLevel::VeryLow);
        assert_eq!(s.level_for(0.45), ConfidenceLevel::Low);
        assert_eq!(s.level_for(0.6), ConfidenceLevel::Medium);
        assert_eq!(s.level_for(0.8), ConfidenceLevel::High);
        assert_eq!(s.level_for(0.85), ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn test_render_templates() {
        assert_eq!(FallbackStrategy::Refuse.render("x"), REFUSAL_MESSAGE);
        assert_eq!(FallbackStrategy::FullAnswer.render(" x "), "x");
        assert!(FallbackStrategy::Cautious.render("x").starts_with("x\n\n"));
        assert!(FallbackStrategy::PartialWithDisclaimer.render("x").ends_with("\n\nx"));
        assert_eq!(
            serde_json::to_string(&FallbackStrategy::FullAnswer).unwrap(),
            "\"full_answer\""
        );
    }

    #[test]
    fn test_non_finite_signals_are_zeroed() {
        let mut s = uniform(0.9);
        s.fact_check_score = f64::NAN;
        let r = scorer().assess(s, healthy());
        assert_eq!(r.signals.fact_check_score, 0.0);
        assert!(r.overall_confidence >= 0.0 && r.overall_confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_score_from_inputs_is_bounded() {
        let scorer = ConfidenceScorer::new(Some(Arc::new(HashingEmbedder::new(256))), ConfidenceConfig::default());
        let context = vec![RetrievalResult {
            document_id: "d".into(),
            content: "Rust guarantees memory safety through ownership and borrowing rules checked at compile time.".into(),
            score: 0.8,
            chunk_index: 0,
            metadata: ResultMetadata::default(),
        }];
        let answer = "Rust achieves memory safety with ownership and borrowing, which the compiler checks at compile time.";
        let r = scorer
            .score(&ConfidenceInput {
                query: "How does Rust guarantee memory safety?",
                answer,
                context: &context,
                retrieval_scores: &[0.8],
                reranker_scores: None,
                fact_check: None,
                validation: None,
            })
            .await;
        assert!(r.overall_confidence >= 0.0 && r.overall_confidence <= 1.0);
        assert_eq!(r.signals.reranker_score, r.signals.retrieval_score);
        assert_eq!(r.signals.fact_check_score, 0.5);
        assert!(r.risk_factors.contains(&RiskFactor::InsufficientContext));
        assert_eq!(r.confidence_breakdown.final_score, r.overall_confidence);
    }
}
