//! The query and indexing pipeline.
//!
//! [`RagPipeline`] owns every stage and is built once per process from
//! explicitly injected [`PipelineServices`]. A query runs strictly in
//! order:
//!
//! ```text
//! history → retrieve → generate (single or best-of-n) → validate
//!         → fact-check → confidence → [web fallback] → merge → format
//! ```
//!
//! `process_query` never fails. Provider failures degrade the stage that
//! hit them and are listed in `quality_assurance.degradations`; every path
//! ends in one of the confidence-banded fallback templates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chunk::{Chunker, ChunkingConfig};
use crate::confidence::{
    ConfidenceConfig, ConfidenceInput, ConfidenceLevel, ConfidenceScorer, FallbackStrategy, RiskFactor,
};
use crate::embedding::EmbeddingProvider;
use crate::error::{stage, PipelineError, Result};
use crate::expand::QueryExpander;
use crate::factcheck::{FactCheckConfig, FactCheckResult, FactCheckSummary, FactChecker};
use crate::format::QueryAwareFormatter;
use crate::generate::{
    AnswerFormat, AnswerGenerator, BestOfNConfig, DraftAnswer, GenerationRequest, GeneratorConfig, HybridWeights,
    ResponseScorer, ScoringMethod,
};
use crate::index::{DocumentFilter, FusionParams, HybridIndex, IndexStats};
use crate::merge::{AnswerMerger, MergeConfig, MergeResult, MergeStrategy, SourceBreakdown};
use crate::models::{AnswerSource, ChatMessage, ChatRole, RetrievalResult, SourceType};
use crate::providers::{CrossEncoderProvider, GenerationProvider, WebSearchProvider};
use crate::question::QuestionType;
use crate::rerank::Reranker;
use crate::retrieve::{RetrievalParams, RetrievalSummary, Retriever};
use crate::store::memory::{InMemoryChatHistory, InMemoryChunkCache, InMemoryDocumentStore};
use crate::store::{ChatHistoryStore, ChunkCache, DocumentStore, MetricsEvent, MetricsSink, NoopMetrics};
use crate::validate::{ResponseValidator, ValidationConfig, ValidationIssue, ValidationResult};
use crate::websearch::{self, WebSearchConfig, WebSearchFallback};

pub const NO_CONTENT_MESSAGE: &str =
    "I couldn't find any content relevant to your question in the indexed documents.";

/// Every external collaborator the pipeline talks to.
pub struct PipelineServices {
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// `None` runs the pipeline index-only; queries degrade to the web
    /// fallback or the no-content answer.
    pub generator: Option<Arc<dyn GenerationProvider>>,
    /// Model used for LLM-judge scoring; defaults to `generator`.
    pub judge: Option<Arc<dyn GenerationProvider>>,
    pub cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
    pub web_search: Option<Arc<dyn WebSearchProvider>>,
    pub chat_history: Arc<dyn ChatHistoryStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub chunk_cache: Arc<dyn ChunkCache>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl PipelineServices {
    /// In-memory stores and no optional providers.
    pub fn in_memory(embedder: Arc<dyn EmbeddingProvider>, generator: Option<Arc<dyn GenerationProvider>>) -> Self {
        Self {
            embedder,
            generator,
            judge: None,
            cross_encoder: None,
            web_search: None,
            chat_history: Arc::new(InMemoryChatHistory::new()),
            documents: Arc::new(InMemoryDocumentStore::new()),
            chunk_cache: Arc::new(InMemoryChunkCache::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub fusion: FusionParams,
    /// Extra abbreviation expansions on top of the built-in table.
    pub abbreviations: BTreeMap<String, String>,
    pub retrieval: RetrievalParams,
    pub rerank_candidates: usize,
    pub top_k: usize,
    pub generator: GeneratorConfig,
    pub validation: ValidationConfig,
    pub best_of_n: BestOfNConfig,
    pub hybrid_weights: HybridWeights,
    pub fact_check: FactCheckConfig,
    pub confidence: ConfidenceConfig,
    pub web_search: WebSearchConfig,
    pub merge: MergeConfig,
    pub response_cache_ttl_secs: u64,
    pub response_cache_capacity: u64,
    /// Confidence reported with the "no content found" answer.
    pub no_content_confidence: f64,
    /// Chat messages loaded per query.
    pub history_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            fusion: FusionParams::default(),
            abbreviations: BTreeMap::new(),
            retrieval: RetrievalParams::default(),
            rerank_candidates: 15,
            top_k: 5,
            generator: GeneratorConfig::default(),
            validation: ValidationConfig::default(),
            best_of_n: BestOfNConfig::default(),
            hybrid_weights: HybridWeights::default(),
            fact_check: FactCheckConfig::default(),
            confidence: ConfidenceConfig::default(),
            web_search: WebSearchConfig::default(),
            merge: MergeConfig::default(),
            response_cache_ttl_secs: 300,
            response_cache_capacity: 500,
            no_content_confidence: 0.2,
            history_limit: 6,
        }
    }
}

/// Per-query switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub best_of_n: bool,
    pub web_search: bool,
    /// Overrides `web_search.confidence_threshold`.
    pub web_threshold: Option<f64>,
    pub format: AnswerFormat,
    pub use_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            best_of_n: false,
            web_search: true,
            web_threshold: None,
            format: AnswerFormat::Auto,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub document_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn for_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }
}

/// A passage or page the answer drew on.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub source_type: SourceType,
    pub document_id: Option<String>,
    pub chunk_id: Option<String>,
    pub chunk_index: Option<i64>,
    pub section_title: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub score: f64,
    pub snippet: String,
}

impl SourceRef {
    fn from_result(r: &RetrievalResult) -> Self {
        Self {
            source_type: SourceType::Local,
            document_id: Some(r.document_id.clone()),
            chunk_id: Some(r.metadata.chunk_id.clone()).filter(|id| !id.is_empty()),
            chunk_index: Some(r.chunk_index),
            section_title: r.metadata.section_title.clone(),
            url: None,
            title: None,
            score: r.score,
            snippet: snippet(&r.content),
        }
    }

    fn from_web(s: &AnswerSource) -> Self {
        Self {
            source_type: SourceType::Web,
            document_id: None,
            chunk_id: None,
            chunk_index: None,
            section_title: None,
            url: s.metadata.get("url").cloned(),
            title: s.metadata.get("title").cloned(),
            score: s.confidence,
            snippet: snippet(&s.content),
        }
    }
}

fn snippet(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= 200 {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(200).collect();
    format!("{}…", cut.trim_end())
}

#[derive(Debug, Clone, Serialize)]
pub struct BestOfNSummary {
    pub generated: usize,
    pub failed: usize,
    pub best_score: f64,
    pub mean_score: f64,
    pub quality_improvement: f64,
    pub scoring_method: ScoringMethod,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingMetrics {
    pub stage_ms: BTreeMap<String, u64>,
    pub total_ms: u64,
    pub retrieval: Option<RetrievalSummary>,
    pub history_messages: usize,
    pub web_search_triggered: bool,
    pub web_results: usize,
    pub best_of_n: Option<BestOfNSummary>,
    pub regenerated: bool,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityAssurance {
    pub question_type: QuestionType,
    pub fact_check: Option<FactCheckSummary>,
    pub local_confidence: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub reliability_score: f64,
    pub should_use_answer: bool,
    pub merge_strategy: MergeStrategy,
    /// Local and web shares of the emitted answer.
    pub source_breakdown: Option<SourceBreakdown>,
    pub validation_score: Option<f64>,
    pub validation_issues: Vec<ValidationIssue>,
    pub fallback_strategy: FallbackStrategy,
    pub degradations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub answer: String,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub sources: Vec<SourceRef>,
    pub processing_metrics: ProcessingMetrics,
    pub quality_assurance: QualityAssurance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Indexed,
    /// Content hash matched the cache; nothing re-chunked or re-embedded.
    Unchanged,
    /// No extractable text.
    Empty,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Indexed => "indexed",
            IndexStatus::Unchanged => "unchanged",
            IndexStatus::Empty => "empty",
            IndexStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReport {
    pub document_id: String,
    pub chunks_created: usize,
    /// Chunks of this document in the index afterwards.
    pub total_chunks: usize,
    pub was_updated: bool,
    pub status: IndexStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WarmStartReport {
    pub documents: usize,
    pub chunks: usize,
    pub failed: usize,
}

/// User feedback on an answer, forwarded to the metrics sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Feedback {
    Rating { query_id: String, rating: u8 },
    Helpful { query_id: String, helpful: bool },
    Correction { query_id: String, correction: String },
}

/// State carried through one query.
struct QueryRun {
    query_id: String,
    started: Instant,
    metrics: ProcessingMetrics,
    degradations: Vec<String>,
}

impl QueryRun {
    fn new() -> Self {
        Self {
            query_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            metrics: ProcessingMetrics::default(),
            degradations: Vec::new(),
        }
    }

    fn time(&mut self, stage: &str, since: Instant) {
        self.metrics
            .stage_ms
            .insert(stage.to_string(), since.elapsed().as_millis() as u64);
    }

    fn degrade(&mut self, err: &PipelineError) {
        warn!(query_id = %self.query_id, error = %err, "pipeline stage degraded");
        self.degradations.push(err.to_string());
    }
}

/// Local answer after generation, validation and fact checking.
struct LocalAnswer {
    text: String,
    validation: ValidationResult,
    fact_check: FactCheckResult,
}

pub struct RagPipeline {
    config: PipelineConfig,
    chunker: Chunker,
    index: Arc<HybridIndex>,
    retriever: Retriever,
    generator: Option<AnswerGenerator>,
    scorer: ResponseScorer,
    validator: ResponseValidator,
    fact_checker: FactChecker,
    confidence: ConfidenceScorer,
    web: WebSearchFallback,
    merger: AnswerMerger,
    formatter: QueryAwareFormatter,
    chat_history: Arc<dyn ChatHistoryStore>,
    documents: Arc<dyn DocumentStore>,
    chunk_cache: Arc<dyn ChunkCache>,
    metrics: Arc<dyn MetricsSink>,
    response_cache: Cache<String, QueryResponse>,
}

impl RagPipeline {
    pub fn new(services: PipelineServices, config: PipelineConfig) -> Self {
        let expander = QueryExpander::with_defaults(config.abbreviations.clone());
        let index = Arc::new(HybridIndex::new(services.embedder.clone(), expander, config.fusion.clone()));
        let reranker = Reranker::new(services.cross_encoder.clone(), config.rerank_candidates);
        let retriever = Retriever::new(index.clone(), reranker, config.retrieval.clone());
        let generator = services
            .generator
            .clone()
            .map(|g| AnswerGenerator::new(g, config.generator.clone()));
        let judge = services.judge.clone().or_else(|| services.generator.clone());
        let scorer = ResponseScorer::new(config.best_of_n.scoring, judge, config.hybrid_weights.clone());
        let response_cache = Cache::builder()
            .max_capacity(config.response_cache_capacity)
            .time_to_live(Duration::from_secs(config.response_cache_ttl_secs.max(1)))
            .build();

        Self {
            chunker: Chunker::new(services.chunk_cache.clone(), config.chunking.clone()),
            retriever,
            generator,
            scorer,
            validator: ResponseValidator::new(config.validation.clone()),
            fact_checker: FactChecker::new(
                services.embedder.clone(),
                services.cross_encoder.clone(),
                config.fact_check.clone(),
            ),
            confidence: ConfidenceScorer::new(Some(services.embedder.clone()), config.confidence.clone()),
            web: WebSearchFallback::new(services.web_search.clone(), config.web_search.clone()),
            merger: AnswerMerger::new(Some(services.embedder.clone()), config.merge.clone()),
            formatter: QueryAwareFormatter::new(),
            chat_history: services.chat_history,
            documents: services.documents,
            chunk_cache: services.chunk_cache,
            metrics: services.metrics,
            index,
            response_cache,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn index(&self) -> &Arc<HybridIndex> {
        &self.index
    }

    // ── Indexing ──────────────────────────────────────────────────────

    pub async fn index_document(&self, document_id: &str, text: &str, force_reprocess: bool) -> IndexReport {
        self.index_document_with_metadata(document_id, text, &BTreeMap::new(), force_reprocess)
            .await
    }

    /// Store, chunk and index a document. `metadata` may carry `title` and
    /// `language` hints for the chunker.
    pub async fn index_document_with_metadata(
        &self,
        document_id: &str,
        text: &str,
        metadata: &BTreeMap<String, String>,
        force_reprocess: bool,
    ) -> IndexReport {
        if let Err(e) = self.documents.put_text(document_id, text).await {
            let err = PipelineError::provider(stage::DOCUMENTS, e);
            warn!(document_id, error = %err, "failed to store document text");
            return self.report(document_id, IndexStatus::Failed, 0, false, Some(err.to_string()));
        }
        self.index_text(document_id, text, metadata, force_reprocess).await
    }

    /// Re-index a document from the text held in the document store.
    pub async fn reindex_from_store(&self, document_id: &str, force_reprocess: bool) -> IndexReport {
        match self.documents.get_text(document_id).await {
            Ok(Some(text)) => self.index_text(document_id, &text, &BTreeMap::new(), force_reprocess).await,
            Ok(None) => self.report(
                document_id,
                IndexStatus::Failed,
                0,
                false,
                Some(format!("document {} not found", document_id)),
            ),
            Err(e) => {
                let err = PipelineError::provider(stage::DOCUMENTS, e);
                self.report(document_id, IndexStatus::Failed, 0, false, Some(err.to_string()))
            }
        }
    }

    async fn index_text(
        &self,
        document_id: &str,
        text: &str,
        metadata: &BTreeMap<String, String>,
        force_reprocess: bool,
    ) -> IndexReport {
        if text.trim().is_empty() {
            let removed = self.index.remove(document_id).await;
            if let Err(e) = self.chunker.forget(document_id).await {
                warn!(document_id, error = %e, "failed to clear chunk cache");
            }
            if removed > 0 {
                self.response_cache.invalidate_all();
            }
            let err = PipelineError::InsufficientContent(format!("document {} has no extractable text", document_id));
            info!(document_id, "{}", err);
            return self.report(document_id, IndexStatus::Empty, 0, removed > 0, Some(err.to_string()));
        }

        let (chunks, was_updated) = self.chunker.chunk(document_id, text, metadata, force_reprocess).await;
        if !was_updated && self.index.contains_document(document_id) {
            return self.report(document_id, IndexStatus::Unchanged, 0, false, None);
        }

        let created = chunks.len();
        match self.index.index(document_id, chunks).await {
            Ok(stored) => {
                self.response_cache.invalidate_all();
                if !was_updated {
                    // Cached chunks restored into an index that didn't have them.
                    return self.report(document_id, IndexStatus::Unchanged, 0, false, None);
                }
                if let Err(e) = self.chunker.update_cache(document_id, text, &stored).await {
                    warn!(document_id, error = %e, "failed to update chunk cache");
                }
                self.report(document_id, IndexStatus::Indexed, created, true, None)
            }
            Err(e) => {
                let err = PipelineError::provider(stage::EMBED, format!("{:#}", e));
                warn!(document_id, error = %err, "indexing failed");
                self.report(document_id, IndexStatus::Failed, 0, false, Some(err.to_string()))
            }
        }
    }

    fn report(
        &self,
        document_id: &str,
        status: IndexStatus,
        chunks_created: usize,
        was_updated: bool,
        message: Option<String>,
    ) -> IndexReport {
        self.metrics.record(MetricsEvent::DocumentIndexed {
            document_id: document_id.to_string(),
            chunks_created,
            status: status.as_str().to_string(),
        });
        IndexReport {
            document_id: document_id.to_string(),
            chunks_created,
            total_chunks: self.index.document_chunks(document_id).len(),
            was_updated,
            status,
            message,
        }
    }

    /// Drop a document from the index, the chunk cache and the document store.
    pub async fn remove_document(&self, document_id: &str) -> anyhow::Result<usize> {
        let removed = self.index.remove(document_id).await;
        self.chunker.forget(document_id).await?;
        self.documents.remove(document_id).await?;
        self.response_cache.invalidate_all();
        info!(document_id, chunks = removed, "document removed");
        Ok(removed)
    }

    /// Rebuild the in-memory index from the chunk cache. Cached chunks carry
    /// their embeddings, so nothing is re-embedded.
    pub async fn warm_start(&self) -> anyhow::Result<WarmStartReport> {
        let mut report = WarmStartReport::default();
        for document_id in self.chunk_cache.document_ids().await? {
            let cached = match self.chunk_cache.get(&document_id).await {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    warn!(document_id = %document_id, error = %e, "failed to read cached chunks");
                    report.failed += 1;
                    continue;
                }
            };
            match self.index.index(&document_id, cached.chunks).await {
                Ok(stored) => {
                    report.documents += 1;
                    report.chunks += stored.len();
                }
                Err(e) => {
                    warn!(document_id = %document_id, error = %e, "failed to restore document");
                    report.failed += 1;
                }
            }
        }
        info!(
            documents = report.documents,
            chunks = report.chunks,
            failed = report.failed,
            "index warm start complete"
        );
        Ok(report)
    }

    /// Forward feedback to the metrics sink. Ratings must be 1–5.
    pub fn submit_feedback(&self, feedback: Feedback) -> Result<()> {
        let (query_id, kind, value) = match feedback {
            Feedback::Rating { query_id, rating } => {
                if !(1..=5).contains(&rating) {
                    return Err(PipelineError::Validation(format!("rating must be 1-5, got {}", rating)));
                }
                (query_id, "rating", rating.to_string())
            }
            Feedback::Helpful { query_id, helpful } => (query_id, "helpful", helpful.to_string()),
            Feedback::Correction { query_id, correction } => {
                if correction.trim().is_empty() {
                    return Err(PipelineError::Validation("correction text is empty".into()));
                }
                (query_id, "correction", correction)
            }
        };
        if query_id.trim().is_empty() {
            return Err(PipelineError::Validation("query id is empty".into()));
        }
        self.metrics.record(MetricsEvent::Feedback {
            query_id,
            kind: kind.to_string(),
            value,
        });
        Ok(())
    }

    // ── Querying ──────────────────────────────────────────────────────

    pub async fn process_query(&self, request: QueryRequest) -> QueryResponse {
        let mut run = QueryRun::new();
        let query = request.query.trim().to_string();
        let options = request.options.clone();
        debug!(query_id = %run.query_id, document_id = ?request.document_id, "processing query");

        if query.is_empty() {
            run.degrade(&PipelineError::InsufficientContent("empty query".into()));
            return self.finish(run, &request, &query, self.no_content(&query), false, "").await;
        }

        let t = Instant::now();
        let history = self.load_history(&request, &mut run).await;
        run.metrics.history_messages = history.len();
        run.time("history", t);

        let use_cache = options.use_cache && history.is_empty();
        let cache_key = cache_key(&query, &request);
        if use_cache {
            if let Some(mut cached) = self.response_cache.get(&cache_key) {
                debug!(query_id = %run.query_id, "response cache hit");
                cached.query_id = run.query_id.clone();
                cached.processing_metrics.cache_hit = true;
                cached.processing_metrics.total_ms = run.started.elapsed().as_millis() as u64;
                self.record_query(&cached, request.document_id.clone());
                self.remember(&request, &query, &cached.answer, &mut run).await;
                return cached;
            }
        }

        let t = Instant::now();
        let filter = request.document_id.as_deref().map(DocumentFilter::document);
        let top_k = options.top_k.unwrap_or(self.config.top_k).max(1);
        let retrieval = match self.retriever.retrieve(&query, top_k, filter.as_ref()).await {
            Ok(r) => Some(r),
            Err(err) => {
                run.degrade(&err);
                None
            }
        };
        run.time("retrieve", t);
        run.metrics.retrieval = retrieval.as_ref().map(|r| r.summary());

        let context: Vec<RetrievalResult> = retrieval.as_ref().map(|r| r.results.clone()).unwrap_or_default();
        if context.is_empty() && filter.is_some() {
            run.degrade(&PipelineError::InsufficientContent(format!(
                "no indexed content for document {}",
                request.document_id.as_deref().unwrap_or_default()
            )));
            let response = self.no_content(&query);
            return self.finish(run, &request, &query, response, use_cache, &cache_key).await;
        }

        let local = if context.is_empty() {
            None
        } else {
            self.answer_locally(&query, &context, &history, &options, &mut run).await
        };

        let t = Instant::now();
        let question_type = QuestionType::classify(&query);
        let assessment = match &local {
            Some(local) => {
                let retrieval_scores = retrieval.as_ref().map(|r| r.retrieval_scores()).unwrap_or_default();
                let rerank_scores = retrieval.as_ref().and_then(|r| r.rerank_scores());
                Some(
                    self.confidence
                        .score(&ConfidenceInput {
                            query: &query,
                            answer: &local.text,
                            context: &context,
                            retrieval_scores: &retrieval_scores,
                            reranker_scores: rerank_scores.as_deref(),
                            fact_check: Some(&local.fact_check),
                            validation: Some(&local.validation),
                        })
                        .await,
                )
            }
            None => None,
        };
        run.time("confidence", t);
        let local_confidence = assessment.as_ref().map_or(0.0, |a| a.overall_confidence);

        let t = Instant::now();
        let threshold = options.web_threshold.unwrap_or(self.config.web_search.confidence_threshold);
        let web_sources = if options.web_search {
            let keywords = websearch::context_keywords(&context, self.config.web_search.max_keywords);
            let outcome = self.web.search(&query, &keywords, local_confidence, threshold).await;
            run.metrics.web_search_triggered = outcome.triggered;
            run.metrics.web_results = outcome.hits.len();
            websearch::to_answer_sources(&outcome.hits)
        } else {
            Vec::new()
        };
        run.time("web_search", t);

        let t = Instant::now();
        let local_source = local.as_ref().map(|l| AnswerSource::local(l.text.clone(), local_confidence));
        let mut merged: MergeResult = self.merger.merge(local_source, web_sources.clone()).await;
        run.time("merge", t);

        if merged.merge_strategy == MergeStrategy::NoSources {
            let response = self.no_content(&query);
            return self.finish(run, &request, &query, response, use_cache, &cache_key).await;
        }

        let t = Instant::now();
        let confidence = merged.confidence.clamp(0.0, 1.0);
        let fallback = match (&assessment, merged.merge_strategy) {
            (Some(a), MergeStrategy::LocalOnly) => a.fallback_recommendation,
            _ => self.confidence.fallback_for(confidence),
        };
        if merged.merge_strategy != MergeStrategy::MultiPerspective {
            let primary = self
                .formatter
                .format_with(&merged.primary_answer, &query, confidence, options.format)
                .text;
            merged.reshape_primary(&primary);
        }
        let disclaimer = match merged.merge_strategy {
            MergeStrategy::WebOnly => None,
            _ => local.as_ref().and_then(|l| l.fact_check.disclaimer.as_deref()),
        };
        let shaped = match disclaimer {
            Some(d) => format!("{}\n\n{}", merged.final_answer.trim(), d),
            None => merged.final_answer.clone(),
        };
        let answer = fallback.render(&shaped);
        run.time("format", t);

        let mut sources: Vec<SourceRef> = Vec::new();
        if merged.merge_strategy != MergeStrategy::WebOnly {
            sources.extend(context.iter().map(SourceRef::from_result));
        }
        if merged.merge_strategy != MergeStrategy::LocalOnly {
            sources.extend(web_sources.iter().map(SourceRef::from_web));
        }

        let (risk_factors, reliability_score, should_use_answer) = match &assessment {
            Some(a) => (
                a.risk_factors.clone(),
                a.reliability_score,
                a.should_use_answer && fallback != FallbackStrategy::Refuse,
            ),
            None => (Vec::new(), 0.0, fallback != FallbackStrategy::Refuse),
        };

        let response = QueryResponse {
            query_id: run.query_id.clone(),
            answer,
            confidence,
            confidence_level: self.confidence.level_for(confidence),
            sources,
            processing_metrics: ProcessingMetrics::default(),
            quality_assurance: QualityAssurance {
                question_type,
                fact_check: local.as_ref().map(|l| l.fact_check.summary()),
                local_confidence,
                risk_factors,
                reliability_score,
                should_use_answer,
                merge_strategy: merged.merge_strategy,
                source_breakdown: Some(merged.source_breakdown),
                validation_score: local.as_ref().map(|l| l.validation.score),
                validation_issues: local.as_ref().map(|l| l.validation.issues.clone()).unwrap_or_default(),
                fallback_strategy: fallback,
                degradations: Vec::new(),
            },
        };
        self.finish(run, &request, &query, response, use_cache, &cache_key).await
    }

    async fn load_history(&self, request: &QueryRequest, run: &mut QueryRun) -> Vec<ChatMessage> {
        let Some(user_id) = request.user_id.as_deref() else {
            return Vec::new();
        };
        match self
            .chat_history
            .get_recent(
                user_id,
                request.document_id.as_deref(),
                request.session_id.as_deref(),
                self.config.history_limit,
            )
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                run.degrade(&PipelineError::provider(stage::HISTORY, e));
                Vec::new()
            }
        }
    }

    /// Generate, validate (with one regeneration) and fact-check.
    async fn answer_locally(
        &self,
        query: &str,
        context: &[RetrievalResult],
        history: &[ChatMessage],
        options: &QueryOptions,
        run: &mut QueryRun,
    ) -> Option<LocalAnswer> {
        let Some(generator) = &self.generator else {
            run.degrade(&PipelineError::provider(stage::GENERATE, "no generation provider configured"));
            return None;
        };
        let req = GenerationRequest {
            question: query,
            context,
            history,
            format: options.format,
        };

        let t = Instant::now();
        let draft: DraftAnswer = if options.best_of_n {
            match generator
                .generate_best_of_n(req, &self.config.best_of_n, &self.scorer)
                .await
            {
                Ok(result) => {
                    run.metrics.best_of_n = Some(BestOfNSummary {
                        generated: result.generated,
                        failed: result.failed,
                        best_score: result.best.confidence_score,
                        mean_score: result.mean_score,
                        quality_improvement: result.quality_improvement,
                        scoring_method: result.scoring_method,
                    });
                    DraftAnswer {
                        confidence: result.best.confidence_score,
                        question_type: QuestionType::classify(query),
                        params: result.best.generation_params,
                        text: result.best.response,
                    }
                }
                Err(err) => {
                    run.degrade(&err);
                    return None;
                }
            }
        } else {
            match generator.generate(req).await {
                Ok(d) => d,
                Err(err) => {
                    run.degrade(&err);
                    return None;
                }
            }
        };
        run.time("generate", t);

        let t = Instant::now();
        let mut text = draft.text;
        let mut validation = self.validator.validate(&text, query, context);
        if !validation.is_valid {
            let issues = validation.improvements();
            debug!(query_id = %run.query_id, issues = ?validation.issues, "draft failed validation, regenerating");
            run.metrics.regenerated = true;
            match generator.regenerate(req, &issues).await {
                Ok(second) => {
                    let second_validation = self.validator.validate(&second.text, query, context);
                    if second_validation.score > validation.score {
                        text = second.text;
                        validation = second_validation;
                    }
                }
                Err(err) => run.degrade(&err),
            }
            if !validation.is_valid {
                let err = PipelineError::Validation(
                    validation
                        .issues
                        .iter()
                        .map(|i| format!("{:?}", i))
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                run.degrade(&err);
            }
        }
        run.time("validate", t);

        let t = Instant::now();
        let fact_check = self.fact_checker.check(&text, context, Some(query)).await;
        run.time("fact_check", t);

        Some(LocalAnswer {
            text: fact_check.filtered_answer.clone(),
            validation,
            fact_check,
        })
    }

    fn no_content(&self, query: &str) -> QueryResponse {
        let confidence = self.config.no_content_confidence.clamp(0.0, 1.0);
        QueryResponse {
            query_id: String::new(),
            answer: NO_CONTENT_MESSAGE.to_string(),
            confidence,
            confidence_level: self.confidence.level_for(confidence),
            sources: Vec::new(),
            processing_metrics: ProcessingMetrics::default(),
            quality_assurance: QualityAssurance {
                question_type: QuestionType::classify(query),
                fact_check: None,
                local_confidence: 0.0,
                risk_factors: Vec::new(),
                reliability_score: 0.0,
                should_use_answer: false,
                merge_strategy: MergeStrategy::NoSources,
                source_breakdown: None,
                validation_score: None,
                validation_issues: Vec::new(),
                fallback_strategy: FallbackStrategy::Refuse,
                degradations: Vec::new(),
            },
        }
    }

    /// Attach run metrics, persist the turn, emit the event and cache.
    async fn finish(
        &self,
        mut run: QueryRun,
        request: &QueryRequest,
        query: &str,
        mut response: QueryResponse,
        use_cache: bool,
        cache_key: &str,
    ) -> QueryResponse {
        self.remember(request, query, &response.answer, &mut run).await;

        response.query_id = run.query_id.clone();
        run.metrics.total_ms = run.started.elapsed().as_millis() as u64;
        response.processing_metrics = run.metrics;
        response.quality_assurance.degradations = run.degradations;

        self.record_query(&response, request.document_id.clone());
        if use_cache {
            self.response_cache.insert(cache_key.to_string(), response.clone());
        }
        info!(
            query_id = %response.query_id,
            confidence = response.confidence,
            strategy = response.quality_assurance.merge_strategy.as_str(),
            total_ms = response.processing_metrics.total_ms,
            "query processed"
        );
        response
    }

    /// Append the user turn and the answer to chat history.
    async fn remember(&self, request: &QueryRequest, query: &str, answer: &str, run: &mut QueryRun) {
        let Some(user_id) = request.user_id.as_deref() else {
            return;
        };
        if query.is_empty() {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        for (role, content) in [(ChatRole::User, query), (ChatRole::Assistant, answer)] {
            let message = ChatMessage {
                user_id: user_id.to_string(),
                document_id: request.document_id.clone(),
                session_id: request.session_id.clone(),
                role,
                content: content.to_string(),
                timestamp: now,
            };
            if let Err(e) = self.chat_history.append(message).await {
                run.degrade(&PipelineError::provider(stage::HISTORY, e));
                return;
            }
        }
    }

    fn record_query(&self, response: &QueryResponse, document_id: Option<String>) {
        self.metrics.record(MetricsEvent::QueryProcessed {
            query_id: response.query_id.clone(),
            document_id,
            confidence: response.confidence,
            confidence_level: response.confidence_level.as_str().to_string(),
            merge_strategy: response.quality_assurance.merge_strategy.as_str().to_string(),
            web_search_triggered: response.processing_metrics.web_search_triggered,
            total_ms: response.processing_metrics.total_ms,
        });
    }
}

fn cache_key(query: &str, request: &QueryRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(crate::text::normalize(query).as_bytes());
    hasher.update([0]);
    hasher.update(request.document_id.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_string(&request.options).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::store::memory::RecordingMetrics;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedGenerator {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationProvider for FixedGenerator {
        fn model_name(&self) -> &str {
            "fixed"
        }
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> AnyResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn pipeline_with(reply: &str) -> (RagPipeline, Arc<FixedGenerator>, Arc<RecordingMetrics>) {
        let generator = Arc::new(FixedGenerator {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(RecordingMetrics::new());
        let mut services = PipelineServices::in_memory(Arc::new(HashingEmbedder::new(256)), Some(generator.clone()));
        services.metrics = metrics.clone();
        (RagPipeline::new(services, PipelineConfig::default()), generator, metrics)
    }

    const DOC: &str = "Cargo is the Rust package manager. Cargo downloads your package dependencies, \
                       compiles your packages, makes distributable packages, and uploads them to crates.io, \
                       the Rust community's package registry.";

    #[tokio::test]
    async fn test_index_then_unchanged() {
        let (p, _, metrics) = pipeline_with("x");
        let first = p.index_document("cargo", DOC, false).await;
        assert_eq!(first.status, IndexStatus::Indexed);
        assert!(first.was_updated);
        assert!(first.chunks_created > 0);
        let second = p.index_document("cargo", DOC, false).await;
        assert_eq!(second.status, IndexStatus::Unchanged);
        assert!(!second.was_updated);
        assert_eq!(second.total_chunks, first.total_chunks);
        assert_eq!(metrics.events().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_document_and_query() {
        let (p, generator, _) = pipeline_with("x");
        let report = p.index_document("blank", "  \n ", false).await;
        assert_eq!(report.status, IndexStatus::Empty);
        assert_eq!(report.chunks_created, 0);

        let response = p.process_query(QueryRequest::new("What is inside?").for_document("blank")).await;
        assert_eq!(response.answer, NO_CONTENT_MESSAGE);
        assert!(response.confidence <= 0.3);
        assert_eq!(response.quality_assurance.merge_strategy, MergeStrategy::NoSources);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(!response.quality_assurance.degradations.is_empty());
    }

    #[tokio::test]
    async fn test_query_is_bounded_and_cached() {
        let (p, generator, _) = pipeline_with(
            "Cargo is the package manager for Rust. It downloads dependencies, compiles packages and uploads them to crates.io.",
        );
        p.index_document("cargo", DOC, false).await;
        let first = p.process_query(QueryRequest::new("What is cargo?")).await;
        assert!(first.confidence >= 0.0 && first.confidence <= 1.0);
        assert!(!first.sources.is_empty());
        assert!(!first.processing_metrics.cache_hit);
        let calls = generator.calls.load(Ordering::SeqCst);

        let second = p.process_query(QueryRequest::new("what is  cargo?")).await;
        assert!(second.processing_metrics.cache_hit);
        assert_ne!(first.query_id, second.query_id);
        assert_eq!(generator.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_history_bypasses_cache_and_is_recorded() {
        let (p, generator, _) = pipeline_with("Cargo builds and publishes Rust packages for you.");
        p.index_document("cargo", DOC, false).await;
        let mut req = QueryRequest::new("What does cargo do?");
        req.user_id = Some("u1".into());
        p.process_query(req.clone()).await;
        let calls = generator.calls.load(Ordering::SeqCst);
        let again = p.process_query(req).await;
        assert!(!again.processing_metrics.cache_hit);
        assert_eq!(again.processing_metrics.history_messages, 2);
        assert!(generator.calls.load(Ordering::SeqCst) > calls);
    }

    #[tokio::test]
    async fn test_feedback_validation() {
        let (p, _, metrics) = pipeline_with("x");
        assert!(p
            .submit_feedback(Feedback::Rating {
                query_id: "q".into(),
                rating: 9
            })
            .is_err());
        p.submit_feedback(Feedback::Helpful {
            query_id: "q".into(),
            helpful: true,
        })
        .unwrap();
        let events = metrics.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "feedback");
    }

    #[tokio::test]
    async fn test_remove_and_warm_start() {
        let cache: Arc<dyn ChunkCache> = Arc::new(InMemoryChunkCache::new());
        let make = |cache: Arc<dyn ChunkCache>| {
            let mut services = PipelineServices::in_memory(Arc::new(HashingEmbedder::new(256)), None);
            services.chunk_cache = cache;
            RagPipeline::new(services, PipelineConfig::default())
        };

        let first = make(cache.clone());
        first.index_document("cargo", DOC, false).await;
        first.index_document("other", "Tokio is an asynchronous runtime for Rust.", false).await;

        let restarted = make(cache.clone());
        assert!(restarted.index().is_empty());
        let report = restarted.warm_start().await.unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(restarted.stats().documents, 2);

        let removed = restarted.remove_document("other").await.unwrap();
        assert!(removed > 0);
        assert_eq!(restarted.stats().documents, 1);
        assert_eq!(cache.document_ids().await.unwrap(), vec!["cargo".to_string()]);
    }

    #[tokio::test]
    async fn test_no_generator_degrades_to_no_content() {
        let services = PipelineServices::in_memory(Arc::new(HashingEmbedder::new(256)), None);
        let p = RagPipeline::new(services, PipelineConfig::default());
        p.index_document("cargo", DOC, false).await;
        let response = p.process_query(QueryRequest::new("What is cargo?")).await;
        assert_eq!(response.answer, NO_CONTENT_MESSAGE);
        assert!(response
            .quality_assurance
            .degradations
            .iter()
            .any(|d| d.contains("generate")));
    }
}
