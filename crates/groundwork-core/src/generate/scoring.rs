//! Candidate scoring for Best-of-N selection.
//!
//! Four methods: keyword density against the question and context,
//! rule-based heuristics, an LLM judging its own output, and a weighted
//! hybrid of the three. A failed LLM judgment falls back to the
//! rule-based score for that candidate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::RetrievalResult;
use crate::providers::GenerationProvider;
use crate::question::{is_implementation_question, is_why_question};
use crate::text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    KeywordDensity,
    #[default]
    RuleBased,
    LlmJudge,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub keyword: f64,
    pub rule: f64,
    pub llm: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            keyword: 0.3,
            rule: 0.4,
            llm: 0.3,
        }
    }
}

/// Per-candidate measurements kept alongside the score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub keyword_density: f64,
    pub rule_based: f64,
    pub llm_judge: Option<f64>,
    pub word_count: usize,
    pub has_structure: bool,
    pub has_code: bool,
    pub hedge_count: usize,
}

const CONNECTORS: &[&str] = &[
    "because",
    "since",
    "therefore",
    "thus",
    "due to",
    "as a result",
    "so that",
    "which means",
    "this is why",
];

static STRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([-*•]\s|\d+[.)]\s|#{1,6}\s)").expect("valid structure regex")
});

static JUDGE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(\.\d+)?").expect("valid number regex"));

pub fn has_structure(response: &str) -> bool {
    STRUCTURE.is_match(response)
}

/// Coverage of the question's content words (60%) and of the context's
/// most frequent terms (40%) in the response.
pub fn keyword_density_score(response: &str, question: &str, context: &[RetrievalResult]) -> f64 {
    let response_words = text::content_words(response);
    if response_words.is_empty() {
        return 0.0;
    }
    let question_cov = text::coverage(question, &response_words);
    if context.is_empty() {
        return question_cov;
    }

    let mut freq: HashMap<String, usize> = HashMap::new();
    for r in context {
        for term in text::terms(&r.content) {
            *freq.entry(term).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top: HashSet<String> = ranked.into_iter().take(20).map(|(t, _)| t).collect();
    let context_cov = if top.is_empty() {
        0.0
    } else {
        top.iter().filter(|t| response_words.contains(*t)).count() as f64 / top.len() as f64
    };

    (0.6 * question_cov + 0.4 * context_cov).clamp(0.0, 1.0)
}

/// Heuristic quality score in `[0, 1]`.
///
/// Earned credit over applicable credit (length, structure, overlap with
/// the question's leading words, plus code fences for implementation
/// questions and connectors for "why" questions), minus a hedging penalty.
pub fn rule_based_score(response: &str, question: &str) -> f64 {
    let words = text::word_count(response);
    if words == 0 {
        return 0.0;
    }

    let mut earned = 0.0;
    let mut possible = 0.0;

    possible += 0.35;
    earned += match words {
        50..=500 => 0.35,
        20..=49 | 501..=800 => 0.2,
        _ => 0.05,
    };

    possible += 0.1;
    if has_structure(response) || words < 120 {
        earned += 0.1;
    }

    possible += 0.25;
    let leading: Vec<String> = text::terms(question).into_iter().take(3).collect();
    if leading.is_empty() {
        earned += 0.25;
    } else {
        let response_words = text::content_words(response);
        let hits = leading.iter().filter(|w| response_words.contains(*w)).count();
        earned += 0.25 * hits as f64 / leading.len() as f64;
    }

    if is_implementation_question(question) {
        possible += 0.15;
        if response.contains("```") {
            earned += 0.15;
        }
    }

    if is_why_question(question) {
        possible += 0.15;
        let lower = response.to_lowercase();
        if CONNECTORS.iter().any(|c| lower.contains(c)) {
            earned += 0.15;
        }
    }

    let hedge_penalty = (0.05 * text::hedge_count(response) as f64).min(0.2);
    (earned / possible - hedge_penalty).clamp(0.0, 1.0)
}

fn judge_prompt(question: &str, response: &str) -> String {
    format!(
        "Rate the following answer to the question on a scale from 1 to 10 for accuracy, \
         completeness and clarity. Reply with only the number.\n\n\
         Question: {}\n\nAnswer: {}\n\nRating:",
        question.trim(),
        response.trim()
    )
}

/// Parse the first number in a judge reply as a 1–10 rating, mapped to `[0, 1]`.
pub fn parse_judge_rating(reply: &str) -> Option<f64> {
    let n: f64 = JUDGE_NUMBER.find(reply)?.as_str().parse().ok()?;
    Some((n.clamp(1.0, 10.0) / 10.0).clamp(0.0, 1.0))
}

pub struct ResponseScorer {
    method: ScoringMethod,
    judge: Option<Arc<dyn GenerationProvider>>,
    weights: HybridWeights,
}

impl ResponseScorer {
    pub fn new(method: ScoringMethod, judge: Option<Arc<dyn GenerationProvider>>, weights: HybridWeights) -> Self {
        Self {
            method,
            judge,
            weights,
        }
    }

    pub fn rule_based() -> Self {
        Self::new(ScoringMethod::RuleBased, None, HybridWeights::default())
    }

    pub fn method(&self) -> ScoringMethod {
        self.method
    }

    async fn judge(&self, question: &str, response: &str) -> Option<f64> {
        let judge = self.judge.as_ref()?;
        match judge.generate(&judge_prompt(question, response), 8, 0.0).await {
            Ok(reply) => {
                let rating = parse_judge_rating(&reply);
                if rating.is_none() {
                    warn!(reply = %reply, "unparseable judge rating");
                }
                rating
            }
            Err(e) => {
                warn!(error = %e, "LLM judge failed, using rule-based score");
                None
            }
        }
    }

    pub async fn score(&self, response: &str, question: &str, context: &[RetrievalResult]) -> (f64, QualityMetrics) {
        let keyword = keyword_density_score(response, question, context);
        let rule = rule_based_score(response, question);
        let llm = match self.method {
            ScoringMethod::LlmJudge | ScoringMethod::Hybrid => self.judge(question, response).await,
            _ => None,
        };

        let score = match self.method {
            ScoringMethod::KeywordDensity => keyword,
            ScoringMethod::RuleBased => rule,
            ScoringMethod::LlmJudge => llm.unwrap_or(rule),
            ScoringMethod::Hybrid => {
                let w = &self.weights;
                let total = w.keyword + w.rule + w.llm;
                let blended = w.keyword * keyword + w.rule * rule + w.llm * llm.unwrap_or(rule);
                if total > 0.0 {
                    blended / total
                } else {
                    rule
                }
            }
        };

        let metrics = QualityMetrics {
            keyword_density: keyword,
            rule_based: rule,
            llm_judge: llm,
            word_count: text::word_count(response),
            has_structure: has_structure(response),
            has_code: response.contains("```"),
            hedge_count: text::hedge_count(response),
        };
        (score.clamp(0.0, 1.0), metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedJudge(&'static str);

    #[async_trait]
    impl GenerationProvider for FixedJudge {
        fn model_name(&self) -> &str {
            "judge"
        }
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct DownJudge;

    #[async_trait]
    impl GenerationProvider for DownJudge {
        fn model_name(&self) -> &str {
            "down"
        }
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
            anyhow::bail!("503")
        }
    }

    #[test]
    fn test_rule_based_prefers_sweet_spot_length() {
        let q = "What is ownership in Rust?";
        let short = "Ownership rules.";
        let good = format!("Ownership in Rust is a set of rules. {}", "Each value has one owner and is dropped at scope end. ".repeat(6));
        assert!(rule_based_score(&good, q) > rule_based_score(short, q));
    }

    #[test]
    fn test_rule_based_penalizes_hedging() {
        let q = "What is ownership?";
        let plain = "Ownership assigns every value a single owner responsible for freeing it.";
        let hedged = "Ownership might maybe assign every value a single owner responsible for freeing it.";
        assert!(rule_based_score(plain, q) > rule_based_score(hedged, q));
    }

    #[test]
    fn test_rule_based_rewards_code_for_implementation() {
        let q = "Write a function that adds two numbers";
        let with_code = "Here is a function that adds two numbers:\n```rust\nfn add(a: i32, b: i32) -> i32 { a + b }\n```";
        let without = "A function that adds two numbers takes both and returns the sum.";
        assert!(rule_based_score(with_code, q) > rule_based_score(without, q));
    }

    #[test]
    fn test_rule_based_rewards_connectors_for_why() {
        let q = "Why is Rust memory safe?";
        let a = "Rust is memory safe because the compiler checks ownership.";
        let b = "Rust is memory safe and the compiler checks ownership.";
        assert!(rule_based_score(a, q) > rule_based_score(b, q));
    }

    #[test]
    fn test_keyword_density_bounds() {
        assert_eq!(keyword_density_score("", "anything", &[]), 0.0);
        let s = keyword_density_score("tokio runtime spawns tasks", "tokio runtime", &[]);
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_judge_rating() {
        assert_eq!(parse_judge_rating("8"), Some(0.8));
        assert_eq!(parse_judge_rating("Rating: 7/10"), Some(0.7));
        assert_eq!(parse_judge_rating("42"), Some(1.0));
        assert_eq!(parse_judge_rating("great"), None);
    }

    #[tokio::test]
    async fn test_llm_judge_score() {
        let scorer = ResponseScorer::new(ScoringMethod::LlmJudge, Some(Arc::new(FixedJudge("9"))), HybridWeights::default());
        let (score, metrics) = scorer.score("An answer.", "A question?", &[]).await;
        assert!((score - 0.9).abs() < 1e-9);
        assert_eq!(metrics.llm_judge, Some(0.9));
    }

    #[tokio::test]
    async fn test_llm_judge_failure_falls_back_to_rules() {
        let scorer = ResponseScorer::new(ScoringMethod::LlmJudge, Some(Arc::new(DownJudge)), HybridWeights::default());
        let (score, metrics) = scorer.score("An answer to the question.", "A question?", &[]).await;
        assert_eq!(metrics.llm_judge, None);
        assert!((score - metrics.rule_based).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hybrid_blend() {
        let scorer = ResponseScorer::new(ScoringMethod::Hybrid, Some(Arc::new(FixedJudge("10"))), HybridWeights::default());
        let (score, m) = scorer.score("tokio runtime answer", "tokio runtime", &[]).await;
        let expected = 0.3 * m.keyword_density + 0.4 * m.rule_based + 0.3 * 1.0;
        assert!((score - expected).abs() < 1e-9);
    }
}
