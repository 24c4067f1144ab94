//! Question-type classification.
//!
//! Shared by the prompt builder (which picks one of six templates), the
//! rule-based scorer, the web fallback (search mode) and the formatter
//! (output shape). Patterns are checked in a fixed priority order so that
//! "what is the difference between…" is a comparison, not a definition.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Definition,
    Explanation,
    Process,
    Comparison,
    Listing,
    CodeAnalysis,
    Troubleshooting,
    Example,
    General,
}

/// The six prompt templates the generator knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplate {
    Definition,
    Explanation,
    Process,
    Comparison,
    Code,
    General,
}

static PATTERNS: LazyLock<Vec<(QuestionType, Regex)>> = LazyLock::new(|| {
    [
        (
            QuestionType::CodeAnalysis,
            r"(?i)(```|\bthis (code|function|snippet|class|method)\b|\bwhat does (this|the following) (code|function|snippet)\b|\breview (my|this)\b)",
        ),
        (
            QuestionType::Troubleshooting,
            r"(?i)\b(error|errors|fix|fixing|not working|doesn't work|does not work|fails?|failing|failed|issue|problem|debug|exception|crash(es|ing)?|broken|troubleshoot)\b",
        ),
        (
            QuestionType::Comparison,
            r"(?i)(\bdifference(s)? between\b|\bvs\.?\s|\bversus\b|\bcompare(d)?\b|\bcomparison\b|\bbetter than\b|\bwhich is better\b|\bpros and cons\b)",
        ),
        (
            QuestionType::Example,
            r"(?i)(\bexamples?\b|\bshow me\b|\bsample\b|\bdemonstrate\b|\billustrate\b)",
        ),
        (
            QuestionType::Process,
            r"(?i)(\bhow (do|to|can|should|would) (i|you|we|one)?\b|\bhow to\b|\bsteps?\b|\binstall\b|\bset ?up\b|\bconfigure\b|\bprocedure\b|\bprocess of\b)",
        ),
        (
            QuestionType::Listing,
            r"(?i)(^\s*list\b|\blist (all|the|some)\b|\bwhat are (the|some)\b|\bname (some|all|the)\b|\benumerate\b|\btypes of\b|\bkinds of\b)",
        ),
        (
            QuestionType::Definition,
            r"(?i)(\bwhat is\b|\bwhat's\b|\bwhat are\b|\bdefine\b|\bdefinition of\b|\bmeaning of\b|\bwhat does \w+ mean\b|\bwho is\b)",
        ),
        (
            QuestionType::Explanation,
            r"(?i)(\bwhy\b|\bexplain\b|\bhow does\b|\bhow is\b|\bhow are\b|\bdescribe\b|\btell me about\b|\bwhat happens\b)",
        ),
    ]
    .into_iter()
    .map(|(t, p)| (t, Regex::new(p).expect("valid question regex")))
    .collect()
});

static IMPLEMENTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(implement|code|function|write|snippet|script|class|method|syntax|program)\b")
        .expect("valid implementation regex")
});

impl QuestionType {
    pub fn classify(question: &str) -> Self {
        PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(question))
            .map(|(t, _)| *t)
            .unwrap_or(QuestionType::General)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Definition => "definition",
            QuestionType::Explanation => "explanation",
            QuestionType::Process => "process",
            QuestionType::Comparison => "comparison",
            QuestionType::Listing => "listing",
            QuestionType::CodeAnalysis => "code_analysis",
            QuestionType::Troubleshooting => "troubleshooting",
            QuestionType::Example => "example",
            QuestionType::General => "general",
        }
    }

    pub fn prompt_template(&self) -> PromptTemplate {
        match self {
            QuestionType::Definition => PromptTemplate::Definition,
            QuestionType::Explanation => PromptTemplate::Explanation,
            QuestionType::Process | QuestionType::Troubleshooting => PromptTemplate::Process,
            QuestionType::Comparison => PromptTemplate::Comparison,
            QuestionType::CodeAnalysis | QuestionType::Example => PromptTemplate::Code,
            QuestionType::Listing | QuestionType::General => PromptTemplate::General,
        }
    }
}

/// Whether the question asks for code (rewards code fences when scoring).
pub fn is_implementation_question(question: &str) -> bool {
    matches!(
        QuestionType::classify(question),
        QuestionType::CodeAnalysis | QuestionType::Example
    ) || IMPLEMENTATION.is_match(question)
}

/// "why" questions reward explanatory connectors.
pub fn is_why_question(question: &str) -> bool {
    question.trim_start().to_lowercase().starts_with("why")
}
