//! Text utilities shared by the chunker, index, scorers and merger.

use std::collections::HashSet;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Placeholder for periods inside abbreviations while splitting sentences.
const MASKED_DOT: char = '\u{E000}';

const ABBREVIATIONS: &[&str] = &[
    "e.g.", "i.e.", "etc.", "vs.", "cf.", "approx.", "Dr.", "Mr.", "Mrs.", "Ms.", "Prof.", "Sr.",
    "Jr.", "St.", "Inc.", "Ltd.", "Co.", "Fig.", "No.", "U.S.", "a.k.a.",
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "do", "does", "for",
    "from", "had", "has", "have", "how", "i", "if", "in", "into", "is", "it", "its", "me", "my",
    "of", "on", "or", "our", "so", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "those", "to", "was", "we", "were", "what", "when", "where",
    "which", "who", "why", "will", "with", "would", "you", "your", "about", "also", "should",
    "could", "did", "not", "no", "yes", "all", "any", "some", "such", "very", "just",
];

/// Words that signal an unsure answer.
pub const HEDGE_WORDS: &[&str] = &[
    "maybe",
    "might",
    "perhaps",
    "possibly",
    "probably",
    "unclear",
    "not sure",
    "i think",
    "it seems",
    "i believe",
];

/// Rough token estimate (`len / 4`), matching the chunker's budget heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Lowercased alphanumeric words (underscores kept, everything else splits).
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Words minus stop words and single characters; the BM25 term stream.
pub fn terms(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .filter(|w| w.chars().count() > 1 && !is_stop_word(w))
        .collect()
}

pub fn content_words(text: &str) -> HashSet<String> {
    terms(text).into_iter().collect()
}

/// Jaccard overlap of content words, in `[0, 1]`.
pub fn lexical_similarity(a: &str, b: &str) -> f64 {
    let wa = content_words(a);
    let wb = content_words(b);
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let inter = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    inter / union
}

/// Share of `needle`'s content words that appear in `haystack`.
pub fn coverage(needle: &str, haystack: &HashSet<String>) -> f64 {
    let words = content_words(needle);
    if words.is_empty() {
        return 0.0;
    }
    words.iter().filter(|w| haystack.contains(*w)).count() as f64 / words.len() as f64
}

pub fn hedge_count(text: &str) -> usize {
    let lower = format!(" {} ", words(text).join(" "));
    HEDGE_WORDS
        .iter()
        .filter(|h| lower.contains(&format!(" {} ", h)))
        .count()
}

pub fn contains_hedging(text: &str) -> bool {
    hedge_count(text) > 0
}

/// Collapse whitespace and lowercase, for verbatim containment checks.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Remove a leading bullet or ordinal marker (`- `, `* `, `1. `, `2) `).
pub fn strip_list_marker(line: &str) -> &str {
    let trimmed = line.trim_start();
    for marker in ["- ", "* ", "• "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 && digits < 4 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim_start();
        }
    }
    trimmed
}

/// Separate fenced code blocks from prose.
///
/// Returns the prose with fences removed and the fenced blocks verbatim
/// (including their ``` lines), in order.
pub fn split_code_fences(text: &str) -> (String, Vec<String>) {
    let mut prose = Vec::new();
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in text.lines() {
        let is_fence = line.trim_start().starts_with("```");
        match current.as_mut() {
            Some(block) => {
                block.push(line);
                if is_fence {
                    blocks.push(block.join("\n"));
                    current = None;
                }
            }
            None if is_fence => current = Some(vec![line]),
            None => prose.push(line),
        }
    }
    if let Some(block) = current {
        blocks.push(block.join("\n"));
    }

    (prose.join("\n"), blocks)
}

/// Split prose into sentences without breaking on abbreviations.
///
/// Abbreviations (`e.g.`, `Dr.`) and decimal points are masked before
/// splitting on `.`, `!` and `?` followed by whitespace, then restored.
/// Line breaks also end a sentence so that list items stay separate.
pub fn split_sentences(text: &str) -> Vec<String> {
    let masked = mask_abbreviations(text);
    let mut sentences = Vec::new();

    for line in masked.lines() {
        let line = strip_list_marker(line);
        if line.trim().is_empty() {
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let mut current = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            current.push(c);
            if matches!(c, '.' | '!' | '?') {
                // Absorb closing quotes / brackets and repeated punctuation.
                while i + 1 < chars.len() && matches!(chars[i + 1], '"' | '\'' | ')' | ']' | '.' | '!' | '?') {
                    i += 1;
                    current.push(chars[i]);
                }
                let at_boundary = i + 1 >= chars.len() || chars[i + 1].is_whitespace();
                if at_boundary {
                    push_sentence(&mut sentences, &current);
                    current.clear();
                }
            }
            i += 1;
        }
        push_sentence(&mut sentences, &current);
    }

    sentences
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let restored = raw.replace(MASKED_DOT, ".");
    let trimmed = restored.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn mask_abbreviations(text: &str) -> String {
    let mut masked = text.to_string();
    for abbr in ABBREVIATIONS {
        if masked.contains(abbr) {
            masked = masked.replace(abbr, &abbr.replace('.', &MASKED_DOT.to_string()));
        }
    }
    // Decimal points: 3.14, v1.2
    let chars: Vec<char> = masked.chars().collect();
    let mut out = String::with_capacity(masked.len());
    for (i, c) in chars.iter().enumerate() {
        let is_decimal = *c == '.'
            && i > 0
            && i + 1 < chars.len()
            && chars[i - 1].is_ascii_digit()
            && chars[i + 1].is_ascii_digit();
        out.push(if is_decimal { MASKED_DOT } else { *c });
    }
    out
}

/// Capitalize the first character.
pub fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Lowercase the first character unless the first word looks like an acronym.
pub fn decapitalize(text: &str) -> String {
    let first_word = text.split_whitespace().next().unwrap_or("");
    if first_word.chars().filter(|c| c.is_uppercase()).count() > 1 {
        return text.to_string();
    }
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentences_basic() {
        let s = split_sentences("Rust is fast. It is safe! Is it fun? Yes.");
        assert_eq!(s, vec!["Rust is fast.", "It is safe!", "Is it fun?", "Yes."]);
    }

    #[test]
    fn test_split_sentences_keeps_abbreviations() {
        let s = split_sentences("Use a crate, e.g. serde, for this. Dr. Smith agrees.");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0], "Use a crate, e.g. serde, for this.");
        assert_eq!(s[1], "Dr. Smith agrees.");
    }

    #[test]
    fn test_split_sentences_keeps_decimals() {
        let s = split_sentences("Version 1.75 added this. It shipped in 2023.");
        assert_eq!(s, vec!["Version 1.75 added this.", "It shipped in 2023."]);
    }

    #[test]
    fn test_split_sentences_list_items() {
        let s = split_sentences("Steps:\n1. Install the tool\n2. Run it");
        assert_eq!(s, vec!["Steps:", "Install the tool", "Run it"]);
    }

    #[test]
    fn test_terms_drop_stop_words() {
        assert_eq!(terms("What is the Borrow checker?"), vec!["borrow", "checker"]);
    }

    #[test]
    fn test_hedging() {
        assert!(contains_hedging("It might work."));
        assert!(contains_hedging("I think so"));
        assert!(!contains_hedging("It works."));
    }

    #[test]
    fn test_split_code_fences() {
        let (prose, blocks) = split_code_fences("Intro.\n```rust\nfn main() {}\n```\nOutro.");
        assert_eq!(prose, "Intro.\nOutro.");
        assert_eq!(blocks, vec!["```rust\nfn main() {}\n```"]);
    }

    #[test]
    fn test_lexical_similarity_bounds() {
        assert_eq!(lexical_similarity("rust cargo", "rust cargo"), 1.0);
        assert_eq!(lexical_similarity("rust", "python"), 0.0);
    }

    #[test]
    fn test_strip_list_marker() {
        assert_eq!(strip_list_marker("- item"), "item");
        assert_eq!(strip_list_marker("12. item"), "item");
        assert_eq!(strip_list_marker("2020 was a year"), "2020 was a year");
    }
}
