//! Reconciling a locally generated answer with web answers.
//!
//! | sources            | similarity / conflict                 | strategy             |
//! |--------------------|---------------------------------------|----------------------|
//! | none               |                                       | `NoSources`          |
//! | local only         |                                       | `LocalOnly`          |
//! | web only           |                                       | `WebOnly` (best hit) |
//! | both               | ≥ threshold, no major conflict        | `SimilarMerge`       |
//! | both               | ≥ complementary floor, no major conflict | `ComplementaryMerge` |
//! | both               | otherwise                             | `MultiPerspective`   |
//!
//! Conflicts are detected from fixed antonym pairs ("yes"/"no",
//! "increase"/"decrease") appearing on opposite sides. This is a coarse
//! heuristic.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::models::{AnswerSource, SourceType};
use crate::text;

const ANTONYM_PAIRS: &[(&str, &str)] = &[
    ("yes", "no"),
    ("true", "false"),
    ("increase", "decrease"),
    ("increases", "decreases"),
    ("always", "never"),
    ("can", "cannot"),
    ("safe", "unsafe"),
    ("enabled", "disabled"),
    ("supported", "unsupported"),
    ("correct", "incorrect"),
    ("possible", "impossible"),
    ("faster", "slower"),
    ("higher", "lower"),
];

pub const PERSPECTIVES_NOTE: &str =
    "These sources do not fully agree; read the two perspectives together.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub similarity_threshold: f64,
    /// Lowest similarity still merged as complementary.
    pub complementary_floor: f64,
    /// Multiplier on `min(local, web)` confidence for multi-perspective answers.
    pub disagreement_penalty: f64,
    /// Sentences borrowed from the secondary answer.
    pub max_added_sentences: usize,
    /// New content words a borrowed sentence must contribute.
    pub min_new_words: usize,
    /// Antonym pairs at which a conflict counts as major.
    pub major_conflict_pairs: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            complementary_floor: 0.5,
            disagreement_penalty: 0.8,
            max_added_sentences: 2,
            min_new_words: 3,
            major_conflict_pairs: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    NoSources,
    LocalOnly,
    WebOnly,
    SimilarMerge,
    ComplementaryMerge,
    MultiPerspective,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::NoSources => "no_sources",
            MergeStrategy::LocalOnly => "local_only",
            MergeStrategy::WebOnly => "web_only",
            MergeStrategy::SimilarMerge => "similar_merge",
            MergeStrategy::ComplementaryMerge => "complementary_merge",
            MergeStrategy::MultiPerspective => "multi_perspective",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictLevel {
    None,
    Minor,
    Major,
}

/// Share of the final answer attributed to each side. Sums to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakdown {
    pub local: f64,
    pub web: f64,
}

impl SourceBreakdown {
    fn new(local: f64, web: f64) -> Self {
        let local = local.clamp(0.0, 1.0);
        let web = web.clamp(0.0, 1.0);
        let total = local + web;
        if total <= f64::EPSILON {
            return Self { local: 0.5, web: 0.5 };
        }
        Self {
            local: local / total,
            web: web / total,
        }
    }

    pub fn total(&self) -> f64 {
        self.local + self.web
    }
}

/// How borrowed text attaches to the primary answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attachment {
    /// Appended to the last paragraph.
    Inline,
    /// Its own paragraph.
    Paragraph,
}

/// Text taken from the secondary side of a similar or complementary merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Addition {
    pub text: String,
    pub from: SourceType,
    pub attachment: Attachment,
}

impl Addition {
    fn attach_to(&self, primary: &str) -> String {
        let primary = primary.trim();
        if primary.is_empty() {
            return self.text.clone();
        }
        match self.attachment {
            Attachment::Inline => format!("{} {}", primary, self.text),
            Attachment::Paragraph => format!("{}\n\n{}", primary, self.text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    /// `primary_answer` with `addition` attached.
    pub final_answer: String,
    /// The leading side's answer as it came into the merge.
    pub primary_answer: String,
    pub addition: Option<Addition>,
    pub confidence: f64,
    pub merge_strategy: MergeStrategy,
    pub source_breakdown: SourceBreakdown,
    pub coherence_score: f64,
    pub quality_metrics: BTreeMap<String, f64>,
    pub similarity: Option<f64>,
    pub conflict_level: ConflictLevel,
    pub metadata: BTreeMap<String, String>,
}

pub struct AnswerMerger {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: MergeConfig,
}

impl AnswerMerger {
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, config: MergeConfig) -> Self {
        Self { embedder, config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub async fn merge(&self, local: Option<AnswerSource>, web: Vec<AnswerSource>) -> MergeResult {
        let local = local.filter(|l| !l.content.trim().is_empty());
        let best_web = web
            .into_iter()
            .filter(|w| !w.content.trim().is_empty())
            .fold(None, |best: Option<AnswerSource>, w| match best {
                Some(b) if b.confidence >= w.confidence => Some(b),
                _ => Some(w),
            });

        let result = match (local, best_web) {
            (None, None) => MergeResult {
                final_answer: String::new(),
                primary_answer: String::new(),
                addition: None,
                confidence: 0.0,
                merge_strategy: MergeStrategy::NoSources,
                source_breakdown: SourceBreakdown { local: 1.0, web: 0.0 },
                coherence_score: 0.0,
                quality_metrics: BTreeMap::new(),
                similarity: None,
                conflict_level: ConflictLevel::None,
                metadata: BTreeMap::new(),
            },
            (Some(l), None) => self.single(l, MergeStrategy::LocalOnly, SourceBreakdown { local: 1.0, web: 0.0 }),
            (None, Some(w)) => self.single(w, MergeStrategy::WebOnly, SourceBreakdown { local: 0.0, web: 1.0 }),
            (Some(l), Some(w)) => self.merge_both(l, w).await,
        };

        debug!(
            strategy = result.merge_strategy.as_str(),
            confidence = result.confidence,
            similarity = ?result.similarity,
            "answers merged"
        );
        result
    }

    fn single(&self, source: AnswerSource, strategy: MergeStrategy, breakdown: SourceBreakdown) -> MergeResult {
        let mut quality_metrics = BTreeMap::new();
        quality_metrics.insert("quality".to_string(), answer_quality(&source));
        MergeResult {
            coherence_score: coherence(&source.content),
            final_answer: source.content.trim().to_string(),
            primary_answer: source.content.trim().to_string(),
            addition: None,
            confidence: source.confidence.clamp(0.0, 1.0),
            merge_strategy: strategy,
            source_breakdown: breakdown,
            quality_metrics,
            similarity: None,
            conflict_level: ConflictLevel::None,
            metadata: source.metadata,
        }
    }

    async fn merge_both(&self, local: AnswerSource, web: AnswerSource) -> MergeResult {
        let similarity = self.similarity(&local.content, &web.content).await;
        let conflict = self.conflict_level(&local.content, &web.content);
        let local_quality = answer_quality(&local);
        let web_quality = answer_quality(&web);

        let strategy = if conflict != ConflictLevel::Major && similarity >= self.config.similarity_threshold {
            MergeStrategy::SimilarMerge
        } else if conflict != ConflictLevel::Major && similarity >= self.config.complementary_floor {
            MergeStrategy::ComplementaryMerge
        } else {
            MergeStrategy::MultiPerspective
        };

        let mut metadata: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in local.metadata.iter() {
            metadata.insert(format!("local_{}", k), v.clone());
        }
        for (k, v) in web.metadata.iter() {
            metadata.insert(format!("web_{}", k), v.clone());
        }

        let (primary_answer, addition, confidence, breakdown) = match strategy {
            MergeStrategy::SimilarMerge => self.similar_merge(&local, &web, local_quality >= web_quality, similarity),
            MergeStrategy::ComplementaryMerge => self.complementary_merge(&local, &web),
            _ => {
                let (answer, confidence, breakdown) = self.multi_perspective(&local, &web);
                (answer, None, confidence, breakdown)
            }
        };
        let final_answer = match &addition {
            Some(a) => a.attach_to(&primary_answer),
            None => primary_answer.clone(),
        };

        let mut quality_metrics = BTreeMap::new();
        quality_metrics.insert("local_quality".to_string(), local_quality);
        quality_metrics.insert("web_quality".to_string(), web_quality);
        quality_metrics.insert("informativeness".to_string(), informativeness(&final_answer));

        MergeResult {
            coherence_score: coherence(&final_answer),
            final_answer,
            primary_answer,
            addition,
            confidence: confidence.clamp(0.0, 1.0),
            merge_strategy: strategy,
            source_breakdown: breakdown,
            quality_metrics,
            similarity: Some(similarity),
            conflict_level: conflict,
            metadata,
        }
    }

    /// Higher-quality answer first, plus up to `max_added_sentences` that
    /// bring new content words.
    fn similar_merge(
        &self,
        local: &AnswerSource,
        web: &AnswerSource,
        local_is_primary: bool,
        similarity: f64,
    ) -> (String, Option<Addition>, f64, SourceBreakdown) {
        let (primary, secondary) = if local_is_primary { (local, web) } else { (web, local) };
        let added = self.novel_sentences(&primary.content, &secondary.content);

        let answer = primary.content.trim().to_string();
        let addition = (!added.is_empty()).then(|| Addition {
            text: added.join(" "),
            from: secondary.source_type,
            attachment: Attachment::Inline,
        });

        let confidence = 0.6 * primary.confidence + 0.4 * secondary.confidence + 0.1 * similarity;
        let breakdown = word_share_breakdown(&answer, addition.as_ref(), local_is_primary);
        (answer, addition, confidence, breakdown)
    }

    /// Higher-confidence answer, extended with an "Additionally, …" clause
    /// drawn from the other side's key sentences.
    fn complementary_merge(
        &self,
        local: &AnswerSource,
        web: &AnswerSource,
    ) -> (String, Option<Addition>, f64, SourceBreakdown) {
        let local_is_primary = local.confidence >= web.confidence;
        let (primary, secondary) = if local_is_primary { (local, web) } else { (web, local) };
        let added = self.novel_sentences(&primary.content, &secondary.content);

        let answer = primary.content.trim().to_string();
        let (addition, primary_weight, secondary_weight) = if added.is_empty() {
            (None, 1.0, 0.0)
        } else {
            let clause = added
                .iter()
                .map(|s| text::decapitalize(s.trim_end_matches(['.', '!', '?'])))
                .collect::<Vec<_>>()
                .join("; ");
            let addition = Addition {
                text: format!("Additionally, {}.", clause),
                from: secondary.source_type,
                attachment: Attachment::Paragraph,
            };
            (Some(addition), 0.7, 0.3)
        };

        let confidence = 0.7 * primary.confidence + 0.3 * secondary.confidence;
        let breakdown = if local_is_primary {
            SourceBreakdown::new(primary_weight, secondary_weight)
        } else {
            SourceBreakdown::new(secondary_weight, primary_weight)
        };
        (answer, addition, confidence, breakdown)
    }

    fn multi_perspective(&self, local: &AnswerSource, web: &AnswerSource) -> (String, f64, SourceBreakdown) {
        let web_label = web
            .metadata
            .get("title")
            .filter(|t| !t.is_empty())
            .map(|t| format!("From the web ({})", t))
            .unwrap_or_else(|| "From the web".to_string());
        let answer = format!(
            "From your documents: {}\n\n{}: {}\n\n{}",
            local.content.trim(),
            web_label,
            web.content.trim(),
            PERSPECTIVES_NOTE
        );
        let confidence = local.confidence.min(web.confidence) * self.config.disagreement_penalty;
        (answer, confidence, SourceBreakdown::new(local.confidence, web.confidence))
    }

    /// Secondary sentences each adding at least `min_new_words` content words
    /// not yet in the primary (or in sentences already taken).
    fn novel_sentences(&self, primary: &str, secondary: &str) -> Vec<String> {
        let mut known: HashSet<String> = text::content_words(primary);
        let mut out = Vec::new();
        for sentence in text::split_sentences(secondary) {
            if out.len() >= self.config.max_added_sentences {
                break;
            }
            let words = text::content_words(&sentence);
            let new: Vec<&String> = words.iter().filter(|w| !known.contains(*w)).collect();
            if new.len() >= self.config.min_new_words {
                known.extend(words.iter().cloned());
                out.push(sentence);
            }
        }
        out
    }

    async fn similarity(&self, a: &str, b: &str) -> f64 {
        if let Some(embedder) = &self.embedder {
            match embedder.embed(&[a.to_string(), b.to_string()]).await {
                Ok(v) if v.len() == 2 => return (cosine_similarity(&v[0], &v[1]) as f64).clamp(0.0, 1.0),
                Ok(_) => warn!("merge similarity embedding returned wrong count, using lexical overlap"),
                Err(e) => warn!(error = %e, "merge similarity embedding failed, using lexical overlap"),
            }
        }
        text::lexical_similarity(a, b)
    }

    pub fn conflict_level(&self, a: &str, b: &str) -> ConflictLevel {
        let wa: HashSet<String> = text::words(a).into_iter().collect();
        let wb: HashSet<String> = text::words(b).into_iter().collect();
        let pairs = ANTONYM_PAIRS
            .iter()
            .filter(|(x, y)| {
                let (x, y) = (x.to_string(), y.to_string());
                (wa.contains(&x) && !wa.contains(&y) && wb.contains(&y) && !wb.contains(&x))
                    || (wa.contains(&y) && !wa.contains(&x) && wb.contains(&x) && !wb.contains(&y))
            })
            .count();
        match pairs {
            0 => ConflictLevel::None,
            n if n >= self.config.major_conflict_pairs => ConflictLevel::Major,
            _ => ConflictLevel::Minor,
        }
    }
}

fn length_score(words: usize) -> f64 {
    match words {
        0 => 0.0,
        1..=29 => words as f64 / 30.0,
        30..=300 => 1.0,
        _ => (300.0 / words as f64).max(0.3),
    }
}

/// Sentence-length regularity, minus repeated sentences.
pub fn coherence(answer: &str) -> f64 {
    let sentences = text::split_sentences(answer);
    if sentences.is_empty() {
        return 0.0;
    }
    let lengths: Vec<usize> = sentences.iter().map(|s| text::word_count(s)).collect();
    let well_formed = lengths.iter().filter(|&&n| (4..=35).contains(&n)).count() as f64 / lengths.len() as f64;
    let unique: HashSet<String> = sentences.iter().map(|s| text::normalize(s)).collect();
    let repetition = 1.0 - unique.len() as f64 / sentences.len() as f64;
    (0.4 + 0.6 * well_formed - repetition).clamp(0.0, 1.0)
}

/// Distinct content words per word, scaled so typical prose lands near 1.
pub fn informativeness(answer: &str) -> f64 {
    let total = text::word_count(answer);
    if total == 0 {
        return 0.0;
    }
    (text::content_words(answer).len() as f64 / total as f64 * 2.0).clamp(0.0, 1.0)
}

/// Even blend of length, coherence, informativeness and stated confidence.
pub fn answer_quality(source: &AnswerSource) -> f64 {
    let words = text::word_count(&source.content);
    0.25 * length_score(words)
        + 0.25 * coherence(&source.content)
        + 0.25 * informativeness(&source.content)
        + 0.25 * source.confidence.clamp(0.0, 1.0)
}

/// Secondary share = borrowed words / all words emitted.
fn word_share_breakdown(primary: &str, addition: Option<&Addition>, local_is_primary: bool) -> SourceBreakdown {
    let added_words = addition.map_or(0, |a| text::word_count(&a.text)) as f64;
    let total_words = (text::word_count(primary) as f64 + added_words).max(1.0);
    let secondary_share = added_words / total_words;
    if local_is_primary {
        SourceBreakdown::new(1.0 - secondary_share, secondary_share)
    } else {
        SourceBreakdown::new(secondary_share, 1.0 - secondary_share)
    }
}

impl MergeResult {
    /// Replace the primary answer with a reshaped version (for example one
    /// cut to a sentence budget) and re-attach the borrowed text, which is
    /// never cut. Similar merges re-derive the breakdown from the words now
    /// emitted.
    pub fn reshape_primary(&mut self, primary: &str) {
        self.primary_answer = primary.trim().to_string();
        self.final_answer = match &self.addition {
            Some(a) => a.attach_to(&self.primary_answer),
            None => self.primary_answer.clone(),
        };
        if self.merge_strategy == MergeStrategy::SimilarMerge {
            let local_is_primary = self.addition.as_ref().map_or(true, |a| a.from == SourceType::Web);
            self.source_breakdown =
                word_share_breakdown(&self.primary_answer, self.addition.as_ref(), local_is_primary);
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self.merge_strategy {
            MergeStrategy::WebOnly => SourceType::Web,
            MergeStrategy::SimilarMerge | MergeStrategy::ComplementaryMerge | MergeStrategy::MultiPerspective => {
                SourceType::Merged
            }
            MergeStrategy::NoSources | MergeStrategy::LocalOnly => SourceType::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn merger() -> AnswerMerger {
        AnswerMerger::new(Some(Arc::new(HashingEmbedder::new(512))), MergeConfig::default())
    }

    #[tokio::test]
    async fn test_no_sources() {
        let r = merger().merge(None, vec![]).await;
        assert_eq!(r.merge_strategy, MergeStrategy::NoSources);
        assert_eq!(r.confidence, 0.0);
        assert!((r.source_breakdown.total() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_local_only_and_web_only() {
        let r = merger().merge(Some(AnswerSource::local("Local answer.", 0.7)), vec![]).await;
        assert_eq!(r.merge_strategy, MergeStrategy::LocalOnly);
        assert_eq!(r.confidence, 0.7);

        let r = merger()
            .merge(None, vec![AnswerSource::web("Weak.", 0.2), AnswerSource::web("Strong.", 0.9)])
            .await;
        assert_eq!(r.merge_strategy, MergeStrategy::WebOnly);
        assert_eq!(r.final_answer, "Strong.");
        assert_eq!(r.source_type(), SourceType::Web);
    }

    #[tokio::test]
    async fn test_similar_merge_adds_novel_sentence() {
        let local = AnswerSource::local(
            "Tokio is an asynchronous runtime for Rust. It schedules tasks on a thread pool.",
            0.8,
        );
        let web = AnswerSource::web(
            "Tokio is an asynchronous runtime for Rust. It schedules tasks on a thread pool. \
             It also bundles timers and sockets.",
            0.7,
        );
        let r = merger().merge(Some(local), vec![web]).await;
        assert_eq!(r.merge_strategy, MergeStrategy::SimilarMerge);
        assert!(r.final_answer.contains("timers"));
        assert!((r.source_breakdown.total() - 1.0).abs() < 1e-9);
        assert!(r.similarity.unwrap() >= 0.75);
    }

    #[tokio::test]
    async fn test_reshaped_similar_merge_keeps_borrowed_sentence() {
        let local = AnswerSource::local(
            "Tokio is an asynchronous runtime for Rust. It schedules tasks on a thread pool.",
            0.8,
        );
        let web = AnswerSource::web(
            "Tokio is an asynchronous runtime for Rust. It schedules tasks on a thread pool. \
             It also bundles timers and sockets.",
            0.7,
        );
        let mut r = merger().merge(Some(local), vec![web]).await;
        assert_eq!(r.merge_strategy, MergeStrategy::SimilarMerge);
        let before = r.source_breakdown.web;

        r.reshape_primary("Tokio is an asynchronous runtime for Rust.");
        assert_eq!(
            r.final_answer,
            "Tokio is an asynchronous runtime for Rust. It also bundles timers and sockets."
        );
        assert!(r.source_breakdown.web > before);
        assert!((r.source_breakdown.total() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_multi_perspective_on_contradiction() {
        let local = AnswerSource::local("Yes, the feature is enabled in the default build of the library.", 0.4);
        let web = AnswerSource::web(
            "No. Recent releases ship it disabled, and users must opt in through a cargo flag.",
            0.8,
        );
        let r = merger().merge(Some(local), vec![web]).await;
        assert_eq!(r.merge_strategy, MergeStrategy::MultiPerspective);
        assert!(r.confidence <= 0.32 + 1e-9);
        assert!(r.final_answer.contains("From your documents:"));
        assert!(r.final_answer.ends_with(PERSPECTIVES_NOTE));
        assert!((r.source_breakdown.total() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_complementary_merge() {
        let config = MergeConfig {
            similarity_threshold: 0.99,
            complementary_floor: 0.0,
            ..Default::default()
        };
        let m = AnswerMerger::new(None, config);
        let local = AnswerSource::local("Serde serializes Rust data structures efficiently.", 0.6);
        let web = AnswerSource::web("Serde supports JSON, YAML and MessagePack formats through separate crates.", 0.5);
        let r = m.merge(Some(local), vec![web]).await;
        assert_eq!(r.merge_strategy, MergeStrategy::ComplementaryMerge);
        assert!(r.final_answer.contains("Additionally, serde supports JSON"));
        assert_eq!(r.primary_answer, "Serde serializes Rust data structures efficiently.");
        assert_eq!(r.addition.as_ref().map(|a| a.from), Some(SourceType::Web));
        assert!((r.confidence - (0.7 * 0.6 + 0.3 * 0.5)).abs() < 1e-9);
        assert!((r.source_breakdown.local - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_conflict_levels() {
        let m = merger();
        assert_eq!(m.conflict_level("yes it works", "it works"), ConflictLevel::None);
        assert_eq!(m.conflict_level("yes it works", "no it does not"), ConflictLevel::Minor);
        assert_eq!(
            m.conflict_level("yes, this is true", "no, this is false"),
            ConflictLevel::Major
        );
    }

    #[tokio::test]
    async fn test_major_conflict_forces_multi_perspective() {
        let config = MergeConfig {
            similarity_threshold: 0.0,
            ..Default::default()
        };
        let m = AnswerMerger::new(None, config);
        let r = m
            .merge(
                Some(AnswerSource::local("Yes, that claim is true.", 0.9)),
                vec![AnswerSource::web("No, that claim is false.", 0.9)],
            )
            .await;
        assert_eq!(r.merge_strategy, MergeStrategy::MultiPerspective);
        assert!((r.confidence - 0.72).abs() < 1e-9);
    }
}
