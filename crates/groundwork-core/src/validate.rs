//! Heuristic quality checks for generated answers.
//!
//! A failing draft triggers one regeneration with the issue descriptions
//! as improvement instructions; a draft that still fails is passed through
//! and flagged, never blocked.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::generate::prompt::contains_source_reference;
use crate::models::RetrievalResult;
use crate::text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssue {
    Empty,
    TooShort,
    TooLong,
    CopiedFromContext,
    SourceReferencePhrase,
    ExcessiveHedging,
    OffTopic,
}

impl ValidationIssue {
    pub fn penalty(&self) -> f64 {
        match self {
            ValidationIssue::Empty => 1.0,
            ValidationIssue::TooShort => 0.3,
            ValidationIssue::TooLong => 0.15,
            ValidationIssue::CopiedFromContext => 0.35,
            ValidationIssue::SourceReferencePhrase => 0.15,
            ValidationIssue::ExcessiveHedging => 0.15,
            ValidationIssue::OffTopic => 0.3,
        }
    }

    /// Instruction handed to the generator on regeneration.
    pub fn improvement(&self) -> &'static str {
        match self {
            ValidationIssue::Empty => "The answer was empty. Provide a complete answer.",
            ValidationIssue::TooShort => "The answer was too short. Give a fuller explanation.",
            ValidationIssue::TooLong => "The answer was too long. Be more concise.",
            ValidationIssue::CopiedFromContext => {
                "The answer copied the context verbatim. Rephrase everything in your own words."
            }
            ValidationIssue::SourceReferencePhrase => {
                "The answer referred to \"the document\" or \"the context\". State the facts directly."
            }
            ValidationIssue::ExcessiveHedging => {
                "The answer hedged too much. State supported facts plainly."
            }
            ValidationIssue::OffTopic => "The answer did not address the question. Answer it directly.",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_words: usize,
    pub max_words: usize,
    /// Share of answer 8-word shingles found verbatim in the context.
    pub copy_threshold: f64,
    pub shingle_size: usize,
    pub max_hedges: usize,
    /// Minimum score for `is_valid`.
    pub pass_score: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_words: 5,
            max_words: 800,
            copy_threshold: 0.5,
            shingle_size: 8,
            max_hedges: 2,
            pass_score: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub score: f64,
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn improvements(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.improvement().to_string()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseValidator {
    config: ValidationConfig,
}

impl ResponseValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, answer: &str, question: &str, context: &[RetrievalResult]) -> ValidationResult {
        let words = text::word_count(answer);
        if words == 0 {
            return ValidationResult {
                score: 0.0,
                is_valid: false,
                issues: vec![ValidationIssue::Empty],
            };
        }

        let mut issues = Vec::new();
        if words < self.config.min_words {
            issues.push(ValidationIssue::TooShort);
        }
        if words > self.config.max_words {
            issues.push(ValidationIssue::TooLong);
        }
        if self.copied_share(answer, context) > self.config.copy_threshold {
            issues.push(ValidationIssue::CopiedFromContext);
        }
        if contains_source_reference(answer) {
            issues.push(ValidationIssue::SourceReferencePhrase);
        }
        if text::hedge_count(answer) > self.config.max_hedges {
            issues.push(ValidationIssue::ExcessiveHedging);
        }
        let question_words = text::content_words(question);
        if !question_words.is_empty() && text::coverage(question, &text::content_words(answer)) == 0.0 {
            issues.push(ValidationIssue::OffTopic);
        }

        let score = (1.0 - issues.iter().map(|i| i.penalty()).sum::<f64>()).clamp(0.0, 1.0);
        ValidationResult {
            score,
            is_valid: score >= self.config.pass_score,
            issues,
        }
    }

    fn copied_share(&self, answer: &str, context: &[RetrievalResult]) -> f64 {
        let answer_shingles = shingles(answer, self.config.shingle_size);
        if answer_shingles.is_empty() || context.is_empty() {
            return 0.0;
        }
        let mut context_shingles: HashSet<String> = HashSet::new();
        for r in context {
            context_shingles.extend(shingles(&r.content, self.config.shingle_size));
        }
        let copied = answer_shingles.iter().filter(|s| context_shingles.contains(*s)).count();
        copied as f64 / answer_shingles.len() as f64
    }
}

fn shingles(input: &str, size: usize) -> HashSet<String> {
    let words = text::words(input);
    if size == 0 || words.len() < size {
        return HashSet::new();
    }
    words.windows(size).map(|w| w.join(" ")).collect()
}
