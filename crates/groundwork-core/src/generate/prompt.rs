//! Prompt construction and output sanitizing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, ChatRole, RetrievalResult};
use crate::question::{PromptTemplate, QuestionType};
use crate::text;

/// Requested answer shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerFormat {
    #[default]
    Auto,
    Paragraph,
    Bullets,
    Numbered,
}

/// Prompt framing used for a generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    Standard,
    /// Adds "every sentence must be supported" constraints.
    Strict,
    /// Leaves out the lowest-ranked passage.
    DroppedChunk,
}

/// Phrases the generator is told never to use, stripped again by [`sanitize`].
pub const SOURCE_REFERENCE_PHRASES: &[&str] = &[
    "based on the document",
    "based on the context",
    "based on the provided",
    "according to the document",
    "according to the context",
    "according to the text",
    "the document states",
    "the document says",
    "the context states",
    "the text says",
    "as mentioned in the document",
    "as stated in the context",
];

static SOURCE_LEAD_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(based on|according to|as (stated|mentioned|described|shown) in)\s+(the\s+)?(provided\s+|given\s+)?(documents?|context|text|passages?|sources?|information)(\s+provided)?\s*,?\s*",
    )
    .expect("valid lead-in regex")
});

static SOURCE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bthe\s+(provided\s+)?(document|context|text|passage)s?\s+(states?|says?|mentions?|explains?|indicates?|notes?)\s+(that\s+)?",
    )
    .expect("valid clause regex")
});

static ANSWER_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*answer\s*:\s*").expect("valid label regex"));

/// Everything needed to render one prompt.
pub struct PromptInput<'a> {
    pub question: &'a str,
    pub context: &'a [RetrievalResult],
    pub history: &'a [ChatMessage],
    pub format: AnswerFormat,
    pub variant: PromptVariant,
    /// Problems found in a previous draft, for regeneration.
    pub improvements: &'a [String],
    pub max_context_chars: usize,
}

fn template_instruction(template: PromptTemplate) -> &'static str {
    match template {
        PromptTemplate::Definition => {
            "Start with a one-sentence definition, then add the most important characteristics."
        }
        PromptTemplate::Explanation => {
            "Explain the underlying reasons and mechanisms, connecting cause and effect."
        }
        PromptTemplate::Process => {
            "Describe the steps in the order they happen. Use a numbered list when there are more than two steps."
        }
        PromptTemplate::Comparison => {
            "Compare the items along the dimensions that matter most and state similarities and differences explicitly."
        }
        PromptTemplate::Code => {
            "Include a short, correct code example in a fenced code block and explain what it does."
        }
        PromptTemplate::General => "Answer the question directly and concisely.",
    }
}

fn format_instruction(format: AnswerFormat) -> Option<&'static str> {
    match format {
        AnswerFormat::Auto => None,
        AnswerFormat::Paragraph => Some("Write the answer as flowing paragraphs, without lists."),
        AnswerFormat::Bullets => Some("Write the answer as a bulleted list."),
        AnswerFormat::Numbered => Some("Write the answer as a numbered list."),
    }
}

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let template = QuestionType::classify(input.question).prompt_template();
    let mut prompt = String::with_capacity(2048);

    prompt.push_str("You are a knowledgeable assistant answering questions about the user's documents.\n\n");
    prompt.push_str("Instructions:\n");
    prompt.push_str(&format!("- {}\n", template_instruction(template)));
    prompt.push_str("- Answer in your own words. Synthesize the information instead of copying sentences from the context.\n");
    prompt.push_str("- Never use phrases such as \"based on the document\", \"according to the context\" or \"the text says\".\n");
    prompt.push_str("- Only state facts supported by the context. If the context does not contain the answer, say that the information is not available.\n");
    if let Some(fmt) = format_instruction(input.format) {
        prompt.push_str(&format!("- {}\n", fmt));
    }
    if input.variant == PromptVariant::Strict {
        prompt.push_str("- Be precise: every sentence must be directly supported by the context. Leave out any detail you are unsure about.\n");
    }
    if !input.improvements.is_empty() {
        prompt.push_str("\nA previous answer had these problems. Avoid them:\n");
        for issue in input.improvements {
            prompt.push_str(&format!("- {}\n", issue));
        }
    }

    if !input.history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for msg in input.history {
            let role = match msg.role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
            };
            prompt.push_str(&format!("{}: {}\n", role, msg.content.trim()));
        }
    }

    let context: &[RetrievalResult] = match input.variant {
        PromptVariant::DroppedChunk if input.context.len() > 1 => &input.context[..input.context.len() - 1],
        _ => input.context,
    };
    prompt.push_str("\nContext:\n");
    let mut used = 0usize;
    for (i, r) in context.iter().enumerate() {
        if used >= input.max_context_chars {
            break;
        }
        let remaining = input.max_context_chars - used;
        let content = truncate_chars(r.content.trim(), remaining);
        used += content.len();
        match &r.metadata.section_title {
            Some(title) => prompt.push_str(&format!("[{}] ({}) {}\n\n", i + 1, title, content)),
            None => prompt.push_str(&format!("[{}] {}\n\n", i + 1, content)),
        }
    }

    prompt.push_str(&format!("Question: {}\n\nAnswer:", input.question.trim()));
    prompt
}

fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Strip an "Answer:" label and source-reference phrasing from model output.
pub fn sanitize(raw: &str) -> String {
    let stripped = ANSWER_LABEL.replace(raw.trim(), "");
    let stripped = SOURCE_LEAD_IN.replace_all(&stripped, "");
    let stripped = SOURCE_CLAUSE.replace_all(&stripped, "");

    let mut in_fence = false;
    let mut lines = Vec::new();
    for line in stripped.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            lines.push(line.trim_end().to_string());
        } else if in_fence || line.starts_with(char::is_whitespace) {
            lines.push(line.trim_end().to_string());
        } else {
            let collapsed = line.split(' ').filter(|w| !w.is_empty()).collect::<Vec<_>>().join(" ");
            lines.push(capitalize_sentences(&collapsed));
        }
    }
    lines.join("\n").trim().to_string()
}

const NON_TERMINAL: &[&str] = &["e.g.", "i.e.", "etc.", "vs.", "cf.", "approx."];

/// Uppercase the first letter of the line and of each following sentence.
fn capitalize_sentences(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut at_start = true;
    let mut word = String::new();
    for c in line.chars() {
        if c == ' ' {
            let lower = word.to_lowercase();
            if word.ends_with(['.', '!', '?']) && !NON_TERMINAL.contains(&lower.as_str()) {
                at_start = true;
            }
            word.clear();
            out.push(c);
            continue;
        }
        word.push(c);
        if at_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
            at_start = false;
        } else {
            out.push(c);
            if c.is_alphanumeric() && !c.is_ascii_digit() {
                at_start = false;
            }
        }
    }
    out
}

/// Does the text still contain a forbidden source-reference phrase?
pub fn contains_source_reference(answer: &str) -> bool {
    let lower = text::normalize(answer);
    SOURCE_REFERENCE_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResultMetadata;

    fn ctx(content: &str) -> RetrievalResult {
        RetrievalResult {
            document_id: "d".into(),
            content: content.into(),
            score: 0.8,
            chunk_index: 0,
            metadata: ResultMetadata::default(),
        }
    }

    fn input<'a>(
        question: &'a str,
        context: &'a [RetrievalResult],
        variant: PromptVariant,
    ) -> PromptInput<'a> {
        PromptInput {
            question,
            context,
            history: &[],
            format: AnswerFormat::Auto,
            variant,
            improvements: &[],
            max_context_chars: 10_000,
        }
    }

    #[test]
    fn test_prompt_contains_anti_copy_directive_and_context() {
        let context = vec![ctx("Closures capture their environment.")];
        let prompt = build_prompt(&input("What is a closure?", &context, PromptVariant::Standard));
        assert!(prompt.contains("in your own words"));
        assert!(prompt.contains("based on the document"));
        assert!(prompt.contains("[1] Closures capture their environment."));
        assert!(prompt.contains("one-sentence definition"));
        assert!(prompt.ends_with("Question: What is a closure?\n\nAnswer:"));
    }

    #[test]
    fn test_dropped_chunk_variant_omits_last_passage() {
        let context = vec![ctx("first passage"), ctx("second passage")];
        let prompt = build_prompt(&input("q", &context, PromptVariant::DroppedChunk));
        assert!(prompt.contains("first passage"));
        assert!(!prompt.contains("second passage"));
    }

    #[test]
    fn test_strict_variant_and_improvements() {
        let context = vec![ctx("x")];
        let issues = vec!["The answer was too short.".to_string()];
        let mut inp = input("q", &context, PromptVariant::Strict);
        inp.improvements = &issues;
        let prompt = build_prompt(&inp);
        assert!(prompt.contains("directly supported"));
        assert!(prompt.contains("The answer was too short."));
    }

    #[test]
    fn test_sanitize_strips_source_references() {
        assert_eq!(
            sanitize("Answer: Based on the document, closures capture variables."),
            "Closures capture variables."
        );
        assert_eq!(
            sanitize("The context states that traits are interfaces. They are flexible."),
            "Traits are interfaces. They are flexible."
        );
    }

    #[test]
    fn test_sanitize_keeps_code_blocks() {
        let raw = "Use this:\n```rust\n    let x = 1;\n```";
        assert_eq!(sanitize(raw), raw);
    }

    #[test]
    fn test_contains_source_reference() {
        assert!(contains_source_reference("According to the document, yes."));
        assert!(!contains_source_reference("Yes."));
    }
}
