//! Question-aware output shaping.
//!
//! The question type picks a [`FormatConfig`]; the answer's prose is cut to
//! a confidence-adjusted sentence budget and laid out as a paragraph, a
//! bulleted list or a numbered list. Fenced code blocks are never touched.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::generate::prompt::AnswerFormat;
use crate::question::QuestionType;
use crate::text;

static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^()]*\)").expect("valid parenthetical regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStyle {
    Paragraph,
    Bullets,
    Numbered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    /// Parenthetical asides are dropped.
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatConfig {
    pub min_sentences: usize,
    pub default_sentences: usize,
    pub max_sentences: usize,
    pub style: OutputStyle,
    pub detail: DetailLevel,
}

impl FormatConfig {
    const fn new(min: usize, default: usize, max: usize, style: OutputStyle, detail: DetailLevel) -> Self {
        Self {
            min_sentences: min,
            default_sentences: default,
            max_sentences: max,
            style,
            detail,
        }
    }

    pub fn for_type(question_type: QuestionType) -> Self {
        use DetailLevel::*;
        use OutputStyle::*;
        match question_type {
            QuestionType::Definition => Self::new(2, 3, 5, Paragraph, Medium),
            QuestionType::Explanation => Self::new(3, 5, 8, Paragraph, High),
            QuestionType::Process => Self::new(3, 6, 10, Numbered, High),
            QuestionType::Comparison => Self::new(3, 5, 8, Bullets, Medium),
            QuestionType::Listing => Self::new(3, 6, 10, Bullets, Low),
            QuestionType::CodeAnalysis => Self::new(2, 4, 8, Paragraph, High),
            QuestionType::Troubleshooting => Self::new(3, 5, 8, Numbered, High),
            QuestionType::Example => Self::new(2, 3, 6, Paragraph, Medium),
            QuestionType::General => Self::new(2, 4, 6, Paragraph, Medium),
        }
    }

    /// Type minimum below 0.5 confidence, one past the default above 0.8.
    pub fn target_sentences(&self, confidence: f64) -> usize {
        if confidence < 0.5 {
            self.min_sentences
        } else if confidence > 0.8 {
            (self.default_sentences + 1).min(self.max_sentences)
        } else {
            self.default_sentences
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedAnswer {
    pub text: String,
    pub question_type: QuestionType,
    pub style: OutputStyle,
    pub target_sentences: usize,
    pub sentence_count: usize,
    pub truncated: bool,
}

enum Segment {
    Prose(String),
    Code(String),
}

fn segments(answer: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut code: Option<Vec<&str>> = None;
    for line in answer.lines() {
        let fence = line.trim_start().starts_with("```");
        match code.as_mut() {
            Some(block) => {
                block.push(line);
                if fence {
                    out.push(Segment::Code(block.join("\n")));
                    code = None;
                }
            }
            None if fence => {
                if !prose.is_empty() {
                    out.push(Segment::Prose(prose.join("\n")));
                    prose.clear();
                }
                code = Some(vec![line]);
            }
            None => prose.push(line),
        }
    }
    if let Some(block) = code {
        out.push(Segment::Code(block.join("\n")));
    }
    if !prose.is_empty() {
        out.push(Segment::Prose(prose.join("\n")));
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct QueryAwareFormatter;

impl QueryAwareFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(&self, answer: &str, question: &str, confidence: f64) -> FormattedAnswer {
        self.format_with(answer, question, confidence, AnswerFormat::Auto)
    }

    /// Like [`format`](Self::format), with an explicit layout request taking
    /// precedence over the question type's style.
    pub fn format_with(&self, answer: &str, question: &str, confidence: f64, requested: AnswerFormat) -> FormattedAnswer {
        let question_type = QuestionType::classify(question);
        let config = FormatConfig::for_type(question_type);
        let style = match requested {
            AnswerFormat::Auto => config.style,
            AnswerFormat::Paragraph => OutputStyle::Paragraph,
            AnswerFormat::Bullets => OutputStyle::Bullets,
            AnswerFormat::Numbered => OutputStyle::Numbered,
        };
        let target = config.target_sentences(confidence);

        let mut budget = target;
        let mut emitted = 0usize;
        let mut truncated = false;
        let mut blocks: Vec<String> = Vec::new();
        let mut numbering = 1usize;

        for segment in segments(answer) {
            match segment {
                Segment::Code(block) => blocks.push(block),
                Segment::Prose(prose) => {
                    let mut sentences: Vec<String> = text::split_sentences(&prose)
                        .into_iter()
                        .map(|s| match config.detail {
                            DetailLevel::Low => PARENTHETICAL.replace_all(&s, "").trim().to_string(),
                            _ => s,
                        })
                        .filter(|s| !s.is_empty())
                        .collect();
                    if sentences.len() > budget {
                        sentences.truncate(budget);
                        truncated = true;
                    }
                    budget -= sentences.len();
                    emitted += sentences.len();
                    if !sentences.is_empty() {
                        blocks.push(layout(&sentences, style, &mut numbering));
                    }
                }
            }
        }

        FormattedAnswer {
            text: blocks.join("\n\n"),
            question_type,
            style,
            target_sentences: target,
            sentence_count: emitted,
            truncated,
        }
    }
}

fn layout(sentences: &[String], style: OutputStyle, numbering: &mut usize) -> String {
    if style == OutputStyle::Paragraph || sentences.len() < 2 {
        return sentences.join(" ");
    }
    let (intro, items) = match sentences.first() {
        Some(first) if first.ends_with(':') => (Some(first.as_str()), &sentences[1..]),
        _ => (None, sentences),
    };
    let mut lines: Vec<String> = Vec::with_capacity(sentences.len());
    if let Some(intro) = intro {
        lines.push(intro.to_string());
    }
    for item in items {
        match style {
            OutputStyle::Numbered => {
                lines.push(format!("{}. {}", numbering, item));
                *numbering += 1;
            }
            _ => lines.push(format!("- {}", item)),
        }
    }
    lines.join("\n")
}
