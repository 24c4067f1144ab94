//! End-to-end behavior of the query pipeline and its quality-control stages,
//! using in-memory stores and scripted providers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use groundwork_core::confidence::{
    AnswerObservations, ConfidenceConfig, ConfidenceInput, ConfidenceScorer, ConfidenceSignals, FallbackStrategy,
};
use groundwork_core::embedding::HashingEmbedder;
use groundwork_core::factcheck::{FactCheckConfig, FactChecker, VerificationMode, RELAXED_DISCLAIMER, UNVERIFIED_DISCLAIMER};
use groundwork_core::format::QueryAwareFormatter;
use groundwork_core::generate::{AnswerFormat, AnswerGenerator, BestOfNConfig, GenerationRequest, GeneratorConfig, ResponseScorer};
use groundwork_core::merge::{AnswerMerger, MergeConfig, MergeStrategy};
use groundwork_core::models::{AnswerSource, ResultMetadata, RetrievalResult, SourceType};
use groundwork_core::pipeline::{IndexStatus, NO_CONTENT_MESSAGE};
use groundwork_core::providers::{CrossEncoderProvider, GenerationProvider, WebHit, WebSearchProvider};
use groundwork_core::rerank::RerankStatus;
use groundwork_core::websearch::{self, WebSearchConfig, WebSearchFallback};
use groundwork_core::{PipelineConfig, PipelineServices, QueryRequest, RagPipeline};

// ── Scripted providers ────────────────────────────────────────────────

struct StaticGenerator(&'static str);

#[async_trait]
impl GenerationProvider for StaticGenerator {
    fn model_name(&self) -> &str {
        "static"
    }
    async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
        Ok(self.0.to_string())
    }
}

struct BrokenGenerator;

#[async_trait]
impl GenerationProvider for BrokenGenerator {
    fn model_name(&self) -> &str {
        "broken"
    }
    async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
        bail!("upstream returned 503")
    }
}

struct BrokenCrossEncoder;

#[async_trait]
impl CrossEncoderProvider for BrokenCrossEncoder {
    async fn score(&self, _query: &str, _passage: &str) -> Result<f64> {
        bail!("reranker timed out")
    }
}

struct CountingSearch {
    calls: AtomicUsize,
    hits: Vec<WebHit>,
}

impl CountingSearch {
    fn new(hits: Vec<WebHit>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            hits,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebSearchProvider for CountingSearch {
    async fn search_and_summarize(&self, _query: &str) -> Result<Vec<WebHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.clone())
    }
}

fn hit(content: &str, relevance: f64) -> WebHit {
    WebHit {
        url: "https://docs.example.org/cache".to_string(),
        title: "Cache settings".to_string(),
        content: content.to_string(),
        relevance,
    }
}

fn ctx(id: &str, content: &str, score: f64) -> RetrievalResult {
    RetrievalResult {
        document_id: id.to_string(),
        content: content.to_string(),
        score,
        chunk_index: 0,
        metadata: ResultMetadata {
            chunk_id: format!("{}-0", id),
            ..Default::default()
        },
    }
}

fn embedder() -> Arc<HashingEmbedder> {
    Arc::new(HashingEmbedder::new(256))
}

const GUIDE: &str = "# Response cache\n\nThe response cache stores finished answers for five minutes. \
                     Entries are keyed by the normalized question and the document filter. \
                     Indexing any document clears the whole cache so stale answers are never served.";

// ── Scenario: empty documents ─────────────────────────────────────────

#[tokio::test]
async fn test_empty_document_yields_no_content_answer() {
    let services = PipelineServices::in_memory(embedder(), Some(Arc::new(StaticGenerator("unused"))));
    let pipeline = RagPipeline::new(services, PipelineConfig::default());

    let report = pipeline.index_document("scan.pdf", "", false).await;
    assert_eq!(report.chunks_created, 0);
    assert_eq!(report.status, IndexStatus::Empty);

    let response = pipeline
        .process_query(QueryRequest::new("What does the scan say about invoices?").for_document("scan.pdf"))
        .await;
    assert_eq!(response.answer, NO_CONTENT_MESSAGE);
    assert!(response.confidence <= 0.3);
    assert!(response.sources.is_empty());
    assert!(!response.quality_assurance.should_use_answer);
    assert_eq!(response.quality_assurance.fallback_strategy, FallbackStrategy::Refuse);
}

// ── Scenario: confident local answer skips the web ────────────────────

#[tokio::test]
async fn test_confident_local_answer_does_not_search_the_web() {
    let scorer = ConfidenceScorer::new(None, ConfidenceConfig::default());
    let signals = ConfidenceSignals {
        retrieval_score: 0.9,
        reranker_score: 0.92,
        semantic_consistency: 0.85,
        context_coverage: 0.88,
        fact_check_score: 0.95,
        response_quality: 0.9,
        query_specificity: 0.85,
        answer_completeness: 0.9,
    };
    let result = scorer.assess(
        signals,
        AnswerObservations {
            answer_words: 70,
            context_words: 350,
            hedging: false,
        },
    );
    assert!(result.risk_factors.is_empty());
    assert!(result.should_use_answer);
    assert_eq!(result.fallback_recommendation, FallbackStrategy::FullAnswer);

    let search = Arc::new(CountingSearch::new(vec![hit("Unused.", 0.9)]));
    let fallback = WebSearchFallback::new(Some(search.clone()), WebSearchConfig::default());
    let outcome = fallback
        .search("How long are answers cached?", &[], result.overall_confidence, 0.75)
        .await;
    assert!(!outcome.triggered);
    assert!(outcome.hits.is_empty());
    assert_eq!(search.calls(), 0);
}

// ── Scenario: low local confidence, contradicting web answer ──────────

#[tokio::test]
async fn test_contradicting_web_answer_gives_multi_perspective() {
    let search = Arc::new(CountingSearch::new(vec![hit(
        "No, response caching ships disabled and stays false until an operator configures it explicitly.",
        0.8,
    )]));
    let fallback = WebSearchFallback::new(Some(search.clone()), WebSearchConfig::default());
    let outcome = fallback
        .search("Is the response cache on by default?", &["cache".to_string()], 0.4, 0.75)
        .await;
    assert!(outcome.triggered);
    assert_eq!(search.calls(), 1);

    let web = websearch::to_answer_sources(&outcome.hits);
    assert!((web[0].confidence - 0.8).abs() < 1e-9);

    let local = AnswerSource::local("Yes, it is true: every deployment keeps answers for five minutes.", 0.4);
    let merger = AnswerMerger::new(Some(embedder()), MergeConfig::default());
    let merged = merger.merge(Some(local), web).await;
    assert_eq!(merged.merge_strategy, MergeStrategy::MultiPerspective);
    assert!(merged.confidence <= 0.32 + 1e-9);
    assert!((merged.source_breakdown.total() - 1.0).abs() < 1e-9);
    assert!(merged.final_answer.contains("From your documents"));
}

// ── Scenario: short verbatim sentence is supported ────────────────────

#[tokio::test]
async fn test_verbatim_short_sentence_is_supported() {
    let checker = FactChecker::new(embedder(), None, FactCheckConfig::default());
    let context = vec![ctx(
        "ts",
        "TypeScript is a language. It adds static types to JavaScript.",
        0.9,
    )];
    let result = checker.check("TypeScript is a language.", &context, None).await;
    assert_eq!(result.num_total_sentences, 1);
    assert!(result.verified_sentences[0].is_supported);
    assert!((result.support_ratio - 1.0).abs() < 1e-9);
}

// ── Scenario: identical candidates show no improvement ────────────────

#[tokio::test]
async fn test_identical_candidates_show_no_improvement() {
    let generator = AnswerGenerator::new(
        Arc::new(StaticGenerator(
            "The response cache keeps finished answers for five minutes and is cleared on indexing.",
        )),
        GeneratorConfig::default(),
    );
    let context = vec![ctx("guide", GUIDE, 0.8)];
    let req = GenerationRequest {
        question: "How long are answers cached?",
        context: &context,
        history: &[],
        format: AnswerFormat::Auto,
    };
    let config = BestOfNConfig {
        n: 5,
        ..Default::default()
    };
    let result = generator
        .generate_best_of_n(req, &config, &ResponseScorer::rule_based())
        .await
        .unwrap();
    assert_eq!(result.generated, 5);
    assert_eq!(result.quality_improvement, 0.0);
    assert!((result.best.confidence_score - result.mean_score).abs() < 1e-9);
}

// ── Properties ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reindexing_unchanged_content_is_idempotent() {
    let services = PipelineServices::in_memory(embedder(), None);
    let pipeline = RagPipeline::new(services, PipelineConfig::default());

    let first = pipeline.index_document("guide.md", GUIDE, false).await;
    assert!(first.was_updated);
    let chunks = pipeline.stats().chunks;

    let second = pipeline.index_document("guide.md", GUIDE, false).await;
    assert!(!second.was_updated);
    assert_eq!(second.status, IndexStatus::Unchanged);
    assert_eq!(pipeline.stats().chunks, chunks);

    let forced = pipeline.index_document("guide.md", GUIDE, true).await;
    assert!(forced.was_updated);
    assert_eq!(pipeline.stats().chunks, chunks);
}

#[tokio::test]
async fn test_confidence_stays_in_bounds() {
    let scorer = ConfidenceScorer::new(Some(embedder()), ConfidenceConfig::default());
    let context = vec![ctx("guide", GUIDE, 0.7), ctx("other", "Unrelated text about gardening.", 0.1)];
    let answers = [
        "",
        "Maybe.",
        "The response cache stores finished answers for five minutes, keyed by the normalized question.",
        "I think it might possibly be cached, perhaps for a while, but I am not sure.",
    ];
    for answer in answers {
        for scores in [vec![], vec![0.0, 0.0], vec![1.0, 0.9], vec![f64::NAN, 2.0]] {
            let result = scorer
                .score(&ConfidenceInput {
                    query: "How long are answers cached?",
                    answer,
                    context: &context,
                    retrieval_scores: &scores,
                    reranker_scores: None,
                    fact_check: None,
                    validation: None,
                })
                .await;
            assert!((0.0..=1.0).contains(&result.overall_confidence), "{answer:?} {scores:?}");
            assert_eq!(result.confidence_breakdown.final_score, result.overall_confidence);
        }
    }
}

#[tokio::test]
async fn test_support_ratio_matches_counts() {
    let checker = FactChecker::new(embedder(), None, FactCheckConfig::default());
    let context = vec![ctx("guide", GUIDE, 0.8)];
    for answer in [
        "",
        "Ok.",
        "The response cache stores finished answers for five minutes.",
        "The response cache stores finished answers for five minutes. \
         Penguins migrate across the southern ocean every winter season.",
    ] {
        let r = checker.check(answer, &context, None).await;
        let expected = if r.num_total_sentences == 0 {
            0.0
        } else {
            r.num_supported_sentences as f64 / r.num_total_sentences as f64
        };
        assert!((r.support_ratio - expected).abs() < 1e-12, "{answer:?}");
    }
}

#[tokio::test]
async fn test_merge_breakdown_sums_to_one() {
    let merger = AnswerMerger::new(Some(embedder()), MergeConfig::default());
    let pairs = [
        (
            "The cache keeps answers for five minutes.",
            "The cache keeps answers for five minutes and clears on indexing.",
        ),
        (
            "Answers are cached for five minutes.",
            "Web results are cached for an hour, keyed by a hash of the question.",
        ),
        ("Yes, caching is always enabled.", "No, caching is never enabled by default."),
    ];
    for (local_conf, web_conf) in [(0.9, 0.1), (0.4, 0.8), (0.0, 0.0)] {
        for (l, w) in pairs {
            let r = merger
                .merge(Some(AnswerSource::local(l, local_conf)), vec![AnswerSource::web(w, web_conf)])
                .await;
            assert!((r.source_breakdown.total() - 1.0).abs() < 1e-9, "{:?}", r.merge_strategy);
            assert!((0.0..=1.0).contains(&r.confidence));
        }
    }
}

#[test]
fn test_should_use_answer_is_monotone_in_confidence() {
    let scorer = ConfidenceScorer::new(None, ConfidenceConfig::default());
    let obs = AnswerObservations {
        answer_words: 60,
        context_words: 300,
        hedging: false,
    };
    let mut seen_true = false;
    for step in 50..=100 {
        let v = step as f64 / 100.0;
        let signals = ConfidenceSignals {
            retrieval_score: v,
            reranker_score: v,
            semantic_consistency: v,
            context_coverage: v,
            fact_check_score: v,
            response_quality: v,
            query_specificity: v,
            answer_completeness: v,
        };
        let r = scorer.assess(signals, obs);
        assert!(r.risk_factors.is_empty());
        if seen_true {
            assert!(r.should_use_answer, "gate closed again at {v}");
        }
        seen_true |= r.should_use_answer;
    }
    assert!(seen_true);
}

#[tokio::test]
async fn test_verification_disclaimer_survives_formatting() {
    let generator = StaticGenerator(
        "Penguins migrate across frozen Antarctic ice shelves every winter. \
         Their colonies can hold many thousands of breeding birds. \
         Emperor penguins huddle together against the polar wind. \
         Chicks shelter on their parents' feet for several weeks. \
         Leopard seals hunt them along the edge of the pack ice.",
    );
    let services = PipelineServices::in_memory(embedder(), Some(Arc::new(generator)));
    let mut config = PipelineConfig::default();
    config.confidence.fallback.refuse = 0.0;
    let pipeline = RagPipeline::new(services, config);
    pipeline.index_document("guide.md", GUIDE, false).await;

    let response = pipeline.process_query(QueryRequest::new("What is the response cache?")).await;
    let fact_check = response.quality_assurance.fact_check.clone().unwrap();
    assert_ne!(fact_check.mode, VerificationMode::Strict);
    assert!(
        response.answer.contains(UNVERIFIED_DISCLAIMER) || response.answer.contains(RELAXED_DISCLAIMER),
        "{}",
        response.answer
    );
    assert!(!response.answer.contains("Leopard seals"));
}

#[tokio::test]
async fn test_complementary_addition_survives_formatting() {
    let config = MergeConfig {
        similarity_threshold: 0.99,
        complementary_floor: 0.0,
        ..Default::default()
    };
    let merger = AnswerMerger::new(None, config);
    let local = AnswerSource::local(
        "The cache stores finished answers for five minutes. Entries are keyed by question. \
         Indexing clears every entry. Expired entries are evicted lazily.",
        0.5,
    );
    let web = AnswerSource::web("Operators can tune the expiry window through configuration files.", 0.4);
    let mut merged = merger.merge(Some(local), vec![web]).await;
    assert_eq!(merged.merge_strategy, MergeStrategy::ComplementaryMerge);

    let primary = QueryAwareFormatter::new().format(&merged.primary_answer, "What about the cache?", 0.45);
    assert!(primary.truncated);
    merged.reshape_primary(&primary.text);

    assert!(merged.final_answer.starts_with("The cache stores finished answers for five minutes."));
    assert!(merged.final_answer.contains("Additionally, operators can tune the expiry window"));
    assert!(!merged.final_answer.contains("evicted lazily"));
    assert!((merged.source_breakdown.web - 0.3).abs() < 1e-9);
}

// ── Degradation paths ─────────────────────────────────────────────────

#[tokio::test]
async fn test_web_only_answer_when_corpus_is_empty() {
    let search = Arc::new(CountingSearch::new(vec![hit(
        "Finished answers are cached for five minutes and dropped whenever a document is re-indexed.",
        0.9,
    )]));
    let mut services = PipelineServices::in_memory(embedder(), Some(Arc::new(StaticGenerator("unused"))));
    services.web_search = Some(search.clone());
    let pipeline = RagPipeline::new(services, PipelineConfig::default());

    let response = pipeline.process_query(QueryRequest::new("How long are answers cached?")).await;
    assert_eq!(search.calls(), 1);
    assert!(response.processing_metrics.web_search_triggered);
    assert_eq!(response.quality_assurance.merge_strategy, MergeStrategy::WebOnly);
    assert_eq!(response.sources.len(), 1);
    assert_eq!(response.sources[0].source_type, SourceType::Web);
    assert_eq!(response.sources[0].url.as_deref(), Some("https://docs.example.org/cache"));
    assert!(response.answer.contains("five minutes"));
}

#[tokio::test]
async fn test_generation_failure_degrades_without_panicking() {
    let services = PipelineServices::in_memory(embedder(), Some(Arc::new(BrokenGenerator)));
    let pipeline = RagPipeline::new(services, PipelineConfig::default());
    pipeline.index_document("guide.md", GUIDE, false).await;

    let response = pipeline.process_query(QueryRequest::new("How long are answers cached?")).await;
    assert_eq!(response.quality_assurance.merge_strategy, MergeStrategy::NoSources);
    assert!(response.confidence <= 0.3);
    assert!(response
        .quality_assurance
        .degradations
        .iter()
        .any(|d| d.contains("503")));
}

#[tokio::test]
async fn test_reranker_failure_keeps_retrieval_order() {
    let mut services = PipelineServices::in_memory(
        embedder(),
        Some(Arc::new(StaticGenerator(
            "The response cache stores finished answers for five minutes. \
             Entries are keyed by the normalized question and the document filter.",
        ))),
    );
    services.cross_encoder = Some(Arc::new(BrokenCrossEncoder));
    let pipeline = RagPipeline::new(services, PipelineConfig::default());
    pipeline.index_document("guide.md", GUIDE, false).await;

    let mut request = QueryRequest::new("How long does the response cache keep answers?");
    request.options.web_search = false;
    let response = pipeline.process_query(request).await;
    let retrieval = response.processing_metrics.retrieval.expect("retrieval ran");
    assert_eq!(retrieval.rerank, RerankStatus::Failed);
    assert!(!response.sources.is_empty());
    assert_eq!(response.quality_assurance.merge_strategy, MergeStrategy::LocalOnly);
    assert!((0.0..=1.0).contains(&response.confidence));
}
