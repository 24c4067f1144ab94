//! Web search fallback for questions the local corpus can't answer
//! confidently.
//!
//! Gated on `local_confidence < threshold`. The question is reformulated
//! for a search engine, results are cached per original question for
//! `cache_ttl_secs`, and provider failures yield an empty list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{stage, PipelineError};
use crate::models::{AnswerSource, RetrievalResult};
use crate::providers::{WebHit, WebSearchProvider};
use crate::question::QuestionType;
use crate::text;

const GENERIC_QUESTION_WORDS: &[&str] = &[
    "what", "which", "who", "whom", "whose", "when", "where", "is", "are", "was", "were", "do", "does",
    "did", "can", "could", "would", "should", "will", "please", "tell", "me", "i", "a", "an", "the",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    pub enabled: bool,
    /// Default trigger threshold for `local_confidence`.
    pub confidence_threshold: f64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub max_results: usize,
    /// Context keywords appended to the reformulated query.
    pub max_keywords: usize,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.75,
            cache_ttl_secs: 3600,
            cache_capacity: 1_000,
            max_results: 5,
            max_keywords: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    General,
    Tutorial,
    Definition,
    Troubleshooting,
}

impl SearchMode {
    pub fn for_question(question: &str) -> Self {
        match QuestionType::classify(question) {
            QuestionType::Definition => SearchMode::Definition,
            QuestionType::Troubleshooting => SearchMode::Troubleshooting,
            QuestionType::Process | QuestionType::Example | QuestionType::CodeAnalysis => SearchMode::Tutorial,
            _ => SearchMode::General,
        }
    }

    fn suffix(&self) -> Option<&'static str> {
        match self {
            SearchMode::General => None,
            SearchMode::Tutorial => Some("tutorial"),
            SearchMode::Definition => Some("definition"),
            SearchMode::Troubleshooting => Some("solution"),
        }
    }
}

/// What happened on one fallback call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WebSearchOutcome {
    pub hits: Vec<WebHit>,
    pub triggered: bool,
    pub cache_hit: bool,
    pub query: Option<String>,
}

pub struct WebSearchFallback {
    provider: Option<Arc<dyn WebSearchProvider>>,
    config: WebSearchConfig,
    cache: Cache<String, Arc<Vec<WebHit>>>,
}

impl WebSearchFallback {
    pub fn new(provider: Option<Arc<dyn WebSearchProvider>>, config: WebSearchConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs.max(1)))
            .build();
        Self {
            provider,
            config,
            cache,
        }
    }

    pub fn disabled() -> Self {
        Self::new(
            None,
            WebSearchConfig {
                enabled: false,
                ..Default::default()
            },
        )
    }

    pub fn config(&self) -> &WebSearchConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.config.enabled && self.provider.is_some()
    }

    /// The trigger gate.
    pub fn should_search(&self, local_confidence: f64, threshold: f64) -> bool {
        self.is_available() && local_confidence < threshold
    }

    pub async fn search(
        &self,
        question: &str,
        context_keywords: &[String],
        local_confidence: f64,
        threshold: f64,
    ) -> WebSearchOutcome {
        if !self.should_search(local_confidence, threshold) {
            return WebSearchOutcome::default();
        }
        let Some(provider) = &self.provider else {
            return WebSearchOutcome::default();
        };

        let key = cache_key(question);
        if let Some(hits) = self.cache.get(&key) {
            debug!(question, "web search cache hit");
            return WebSearchOutcome {
                hits: hits.as_ref().clone(),
                triggered: true,
                cache_hit: true,
                query: None,
            };
        }

        let mode = SearchMode::for_question(question);
        let query = reformulate(question, context_keywords, mode, self.config.max_keywords);
        info!(query = %query, local_confidence, threshold, "web search fallback triggered");

        let hits = match provider.search_and_summarize(&query).await {
            Ok(mut hits) => {
                hits.retain(|h| !h.content.trim().is_empty());
                hits.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
                hits.truncate(self.config.max_results);
                if !hits.is_empty() {
                    self.cache.insert(key, Arc::new(hits.clone()));
                }
                hits
            }
            Err(e) => {
                warn!(error = %PipelineError::provider(stage::WEB_SEARCH, e), "web search failed, continuing local-only");
                Vec::new()
            }
        };

        WebSearchOutcome {
            hits,
            triggered: true,
            cache_hit: false,
            query: Some(query),
        }
    }
}

fn cache_key(question: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text::normalize(question).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Strip generic question words (keeping "how" and "why"), append context
/// keywords not already present and the mode's suffix.
pub fn reformulate(question: &str, context_keywords: &[String], mode: SearchMode, max_keywords: usize) -> String {
    let mut parts: Vec<String> = question
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '+' || c == '#')))
        .map(|w| w.trim_end_matches('.'))
        .filter(|w| !w.is_empty() && !GENERIC_QUESTION_WORDS.contains(&w.to_lowercase().as_str()))
        .map(str::to_string)
        .collect();

    let present: Vec<String> = parts.iter().map(|p| p.to_lowercase()).collect();
    let extra: Vec<String> = context_keywords
        .iter()
        .filter(|k| !present.contains(&k.to_lowercase()))
        .take(max_keywords)
        .cloned()
        .collect();
    parts.extend(extra);

    if let Some(suffix) = mode.suffix() {
        if !parts.iter().any(|p| p.eq_ignore_ascii_case(suffix)) {
            parts.push(suffix.to_string());
        }
    }
    parts.join(" ")
}

/// Most frequent content terms across the context, most frequent first.
pub fn context_keywords(context: &[RetrievalResult], limit: usize) -> Vec<String> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for r in context {
        for term in text::terms(&r.content) {
            if term.chars().count() > 2 && !term.chars().all(|c| c.is_ascii_digit()) {
                *freq.entry(term).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(t, _)| t).collect()
}

/// Hits as merger inputs; confidence is the hit's clamped relevance.
pub fn to_answer_sources(hits: &[WebHit]) -> Vec<AnswerSource> {
    hits.iter()
        .map(|h| {
            AnswerSource::web(h.content.trim(), h.relevance)
                .with_meta("url", h.url.clone())
                .with_meta("title", h.title.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSearch {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSearch {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl WebSearchProvider for CountingSearch {
        async fn search_and_summarize(&self, query: &str) -> Result<Vec<WebHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("timeout");
            }
            Ok(vec![
                WebHit {
                    url: "https://a.example".into(),
                    title: "A".into(),
                    content: format!("low relevance result for {}", query),
                    relevance: 0.3,
                },
                WebHit {
                    url: "https://b.example".into(),
                    title: "B".into(),
                    content: "high relevance result".into(),
                    relevance: 1.4,
                },
            ])
        }
    }

    #[tokio::test]
    async fn test_gate_blocks_confident_local_answers() {
        let provider = Arc::new(CountingSearch::new(false));
        let web = WebSearchFallback::new(Some(provider.clone()), WebSearchConfig::default());
        let out = web.search("What is tokio?", &[], 0.9, 0.75).await;
        assert!(!out.triggered);
        assert!(out.hits.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_triggered_search_is_sorted_and_cached() {
        let provider = Arc::new(CountingSearch::new(false));
        let web = WebSearchFallback::new(Some(provider.clone()), WebSearchConfig::default());
        let first = web.search("What is tokio?", &[], 0.4, 0.75).await;
        assert!(first.triggered);
        assert!(!first.cache_hit);
        assert_eq!(first.hits[0].title, "B");
        assert_eq!(first.query.as_deref(), Some("tokio definition"));

        let second = web.search("what is   TOKIO?", &[], 0.4, 0.75).await;
        assert!(second.cache_hit);
        assert_eq!(second.hits.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_returns_empty() {
        let provider = Arc::new(CountingSearch::new(true));
        let web = WebSearchFallback::new(Some(provider.clone()), WebSearchConfig::default());
        let out = web.search("Why is my build failing?", &[], 0.1, 0.75).await;
        assert!(out.triggered);
        assert!(out.hits.is_empty());
        web.search("Why is my build failing?", &[], 0.1, 0.75).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_never_searches() {
        let web = WebSearchFallback::disabled();
        assert!(!web.should_search(0.0, 0.75));
        assert!(!web.search("anything", &[], 0.0, 0.75).await.triggered);
    }

    #[test]
    fn test_reformulate_keeps_how_and_why() {
        let q = reformulate("How do I configure tokio runtime?", &[], SearchMode::Tutorial, 3);
        assert_eq!(q, "How configure tokio runtime tutorial");
        let q = reformulate("Why does serde fail?", &["derive".into(), "serde".into()], SearchMode::General, 3);
        assert_eq!(q, "Why serde fail derive");
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(SearchMode::for_question("What is a trait?"), SearchMode::Definition);
        assert_eq!(SearchMode::for_question("Linker error on build"), SearchMode::Troubleshooting);
        assert_eq!(SearchMode::for_question("How do I install rustup?"), SearchMode::Tutorial);
        assert_eq!(SearchMode::for_question("Tokio runtime"), SearchMode::General);
    }

    #[test]
    fn test_answer_sources_clamp_relevance() {
        let hits = vec![WebHit {
            url: "u".into(),
            title: "t".into(),
            content: " body ".into(),
            relevance: 1.7,
        }];
        let sources = to_answer_sources(&hits);
        assert_eq!(sources[0].confidence, 1.0);
        assert_eq!(sources[0].content, "body");
        assert_eq!(sources[0].metadata.get("url").map(String::as_str), Some("u"));
    }

    #[test]
    fn test_context_keywords_by_frequency() {
        let ctx = |c: &str| RetrievalResult {
            document_id: "d".into(),
            content: c.into(),
            score: 0.5,
            chunk_index: 0,
            metadata: Default::default(),
        };
        let kw = context_keywords(&[ctx("tokio runtime tokio tasks"), ctx("tokio executor")], 2);
        assert_eq!(kw[0], "tokio");
        assert_eq!(kw.len(), 2);
    }
}
