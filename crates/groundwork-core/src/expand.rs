//! Query-time abbreviation expansion.
//!
//! Jargon like "k8s" or "RAG" embeds poorly and never matches the spelled
//! out form lexically. Known abbreviations found in the query have their
//! canonical form appended, so both the dense and the sparse side see it.
//! E.g., "rag eval" → "rag eval retrieval augmented generation".

use std::collections::BTreeMap;

use crate::text;

/// Built-in abbreviation table. Config entries are merged over it.
pub fn default_abbreviations() -> BTreeMap<String, String> {
    [
        ("ai", "artificial intelligence"),
        ("api", "application programming interface"),
        ("async", "asynchronous"),
        ("auth", "authentication"),
        ("cd", "continuous delivery"),
        ("ci", "continuous integration"),
        ("cli", "command line interface"),
        ("config", "configuration"),
        ("db", "database"),
        ("env", "environment"),
        ("err", "error"),
        ("js", "javascript"),
        ("k8s", "kubernetes"),
        ("llm", "large language model"),
        ("ml", "machine learning"),
        ("nlp", "natural language processing"),
        ("os", "operating system"),
        ("perf", "performance"),
        ("py", "python"),
        ("rag", "retrieval augmented generation"),
        ("repo", "repository"),
        ("ts", "typescript"),
        ("ui", "user interface"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone)]
pub struct QueryExpander {
    abbreviations: BTreeMap<String, String>,
}

impl QueryExpander {
    /// Keys are matched case-insensitively against whole query words.
    pub fn new(abbreviations: BTreeMap<String, String>) -> Self {
        Self {
            abbreviations: abbreviations
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        }
    }

    /// Expander with the built-in table plus `extra` (which wins on conflicts).
    pub fn with_defaults(extra: BTreeMap<String, String>) -> Self {
        let mut table = default_abbreviations();
        table.extend(extra.into_iter().map(|(k, v)| (k.to_lowercase(), v)));
        Self::new(table)
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    /// Canonical forms to append, in query order, without duplicates or
    /// terms the query already spells out.
    pub fn expansions(&self, query: &str) -> Vec<&str> {
        let lower = query.to_lowercase();
        let mut out: Vec<&str> = Vec::new();
        for word in text::words(query) {
            if let Some(canonical) = self.abbreviations.get(&word) {
                if !lower.contains(&canonical.to_lowercase()) && !out.contains(&canonical.as_str()) {
                    out.push(canonical);
                }
            }
        }
        out
    }

    pub fn expand(&self, query: &str) -> String {
        let expansions = self.expansions(query);
        if expansions.is_empty() {
            return query.to_string();
        }
        format!("{} {}", query.trim_end(), expansions.join(" "))
    }
}

impl Default for QueryExpander {
    fn default() -> Self {
        Self::new(default_abbreviations())
    }
}
