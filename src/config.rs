//! TOML configuration.
//!
//! Every section is optional except `[db]`. Sections that mirror a core
//! stage (`[chunking]`, `[fact_check]`, `[confidence]`, `[best_of_n]`,
//! `[merge]`, `[validation]`) deserialize straight into the core config
//! types; the rest are app-level and carry their own defaults.
//!
//! ```toml
//! [db]
//! path = "./data/gw.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "ollama"
//! model = "llama3.1"
//!
//! [retrieval.abbreviations]
//! k8s = "kubernetes"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use groundwork_core::chunk::ChunkingConfig;
use groundwork_core::confidence::ConfidenceConfig;
use groundwork_core::factcheck::FactCheckConfig;
use groundwork_core::generate::{BestOfNConfig, GeneratorConfig, HybridWeights};
use groundwork_core::index::sparse::Bm25Params;
use groundwork_core::index::FusionParams;
use groundwork_core::merge::MergeConfig;
use groundwork_core::retrieve::RetrievalParams;
use groundwork_core::validate::ValidationConfig;
use groundwork_core::websearch::WebSearchConfig;
use groundwork_core::PipelineConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub web_search: WebSearchSection,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub fact_check: FactCheckConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub best_of_n: BestOfNConfig,
    #[serde(default)]
    pub scoring_weights: HybridWeights,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub documents: DocumentsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f64,
    #[serde(default = "default_sparse_divisor")]
    pub sparse_divisor: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    /// Candidates sent to the cross-encoder.
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
    /// Extra query-expansion entries, merged over the built-in table.
    #[serde(default)]
    pub abbreviations: BTreeMap<String, String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
            sparse_divisor: default_sparse_divisor(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            rerank_candidates: default_rerank_candidates(),
            abbreviations: BTreeMap::new(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_dense_weight() -> f64 {
    0.7
}
fn default_sparse_weight() -> f64 {
    0.3
}
fn default_sparse_divisor() -> f64 {
    10.0
}
fn default_bm25_k1() -> f64 {
    1.2
}
fn default_bm25_b() -> f64 {
    0.75
}
fn default_rerank_candidates() -> usize {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hashing` (offline), `openai` or `ollama`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// Vector width; the hashing embedder defaults to 384.
    pub fn effective_dims(&self) -> usize {
        self.dims.unwrap_or(384)
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `openai` or `ollama`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL override (OpenAI-compatible servers, remote Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Separate model for LLM-judge scoring; defaults to `model`.
    #[serde(default)]
    pub judge_model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            api_key_env: default_openai_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            history_turns: default_history_turns(),
            max_context_chars: default_max_context_chars(),
            judge_model: None,
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.3
}
fn default_history_turns() -> usize {
    6
}
fn default_max_context_chars() -> usize {
    12_000
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `disabled` or `http` (a TEI-compatible `/rerank` endpoint).
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchSection {
    /// `disabled` or `http`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_web_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_web_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub settings: WebSearchConfig,
}

impl Default for WebSearchSection {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            api_key_env: default_web_key_env(),
            max_retries: default_web_retries(),
            timeout_secs: default_timeout_secs(),
            settings: WebSearchConfig::default(),
        }
    }
}

fn default_web_key_env() -> String {
    "GW_WEB_SEARCH_KEY".to_string()
}
fn default_web_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSection {
    #[serde(default = "default_response_cache_ttl")]
    pub response_cache_ttl_secs: u64,
    #[serde(default = "default_response_cache_capacity")]
    pub response_cache_capacity: u64,
    #[serde(default = "default_no_content_confidence")]
    pub no_content_confidence: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            response_cache_ttl_secs: default_response_cache_ttl(),
            response_cache_capacity: default_response_cache_capacity(),
            no_content_confidence: default_no_content_confidence(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_response_cache_ttl() -> u64 {
    300
}
fn default_response_cache_capacity() -> u64 {
    500
}
fn default_no_content_confidence() -> f64 {
    0.2
}
fn default_history_limit() -> usize {
    6
}

/// File selection for `gw index <dir>`.
#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Files larger than this are skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.md", "**/*.txt", "**/*.rst", "**/*.rs", "**/*.py", "**/*.js", "**/*.ts", "**/*.go",
        "**/*.java", "**/*.c", "**/*.cpp", "**/*.h",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_file_bytes() -> u64 {
    2 * 1024 * 1024
}

impl Config {
    /// Core pipeline settings assembled from every section.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chunking: self.chunking.clone(),
            fusion: FusionParams {
                sparse_divisor: self.retrieval.sparse_divisor,
                bm25: Bm25Params {
                    k1: self.retrieval.bm25_k1,
                    b: self.retrieval.bm25_b,
                },
            },
            abbreviations: self.retrieval.abbreviations.clone(),
            retrieval: RetrievalParams {
                candidate_multiplier: self.retrieval.candidate_multiplier,
                dense_weight: self.retrieval.dense_weight,
                sparse_weight: self.retrieval.sparse_weight,
            },
            rerank_candidates: self.retrieval.rerank_candidates,
            top_k: self.retrieval.top_k,
            generator: GeneratorConfig {
                max_tokens: self.generation.max_tokens,
                temperature: self.generation.temperature,
                history_turns: self.generation.history_turns,
                max_context_chars: self.generation.max_context_chars,
            },
            validation: self.validation.clone(),
            best_of_n: self.best_of_n.clone(),
            hybrid_weights: self.scoring_weights.clone(),
            fact_check: self.fact_check.clone(),
            confidence: self.confidence.clone(),
            web_search: self.web_search.settings.clone(),
            merge: self.merge.clone(),
            response_cache_ttl_secs: self.pipeline.response_cache_ttl_secs,
            response_cache_capacity: self.pipeline.response_cache_capacity,
            no_content_confidence: self.pipeline.no_content_confidence,
            history_limit: self.pipeline.history_limit,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be in [0.0, 1.0], got {}", name, value);
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_chunk_size == 0 {
        bail!("chunking.max_chunk_size must be > 0");
    }
    if config.chunking.min_chunk_size > config.chunking.max_chunk_size {
        bail!("chunking.min_chunk_size must not exceed chunking.max_chunk_size");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_chunk_size {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_chunk_size");
    }

    // Retrieval
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    check_unit("retrieval.dense_weight", config.retrieval.dense_weight)?;
    check_unit("retrieval.sparse_weight", config.retrieval.sparse_weight)?;
    if config.retrieval.sparse_divisor <= 0.0 {
        bail!("retrieval.sparse_divisor must be > 0");
    }

    // Quality thresholds
    check_unit("fact_check.support_threshold", config.fact_check.support_threshold)?;
    check_unit("confidence.strict_threshold", config.confidence.strict_threshold)?;
    check_unit("confidence.risk_damping_base", config.confidence.risk_damping_base)?;
    for (name, weight) in config.confidence.weights.as_pairs() {
        check_unit(&format!("confidence.weights.{}", name), weight)?;
    }
    check_unit("merge.similarity_threshold", config.merge.similarity_threshold)?;
    check_unit("merge.complementary_floor", config.merge.complementary_floor)?;
    if config.merge.complementary_floor > config.merge.similarity_threshold {
        bail!("merge.complementary_floor must not exceed merge.similarity_threshold");
    }
    check_unit("web_search.confidence_threshold", config.web_search.settings.confidence_threshold)?;
    check_unit("pipeline.no_content_confidence", config.pipeline.no_content_confidence)?;
    if config.best_of_n.n == 0 {
        bail!("best_of_n.n must be >= 1");
    }

    // Providers
    match config.embedding.provider.as_str() {
        "hashing" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, or ollama.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.generation.model.is_none() {
                bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.rerank.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.rerank.url.is_none() {
                bail!("rerank.url must be specified when provider is 'http'");
            }
        }
        other => bail!("Unknown rerank provider: '{}'. Must be disabled or http.", other),
    }

    match config.web_search.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.web_search.url.is_none() {
                bail!("web_search.url must be specified when provider is 'http'");
            }
        }
        other => bail!("Unknown web_search provider: '{}'. Must be disabled or http.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./gw.sqlite\"\n").unwrap();
        assert_eq!(config.embedding.provider, "hashing");
        assert!(!config.generation.is_enabled());
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.chunking.max_chunk_size, 512);
        assert_eq!(config.web_search.settings.confidence_threshold, 0.75);
        assert_eq!(config.confidence.free_risks, 3);

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.retrieval.candidate_multiplier, 3);
        assert_eq!(pipeline.response_cache_ttl_secs, 300);
    }

    #[test]
    fn test_sections_override_core_defaults() {
        let config = parse(
            r#"
[db]
path = "./gw.sqlite"

[retrieval]
dense_weight = 0.5
sparse_weight = 0.5

[retrieval.abbreviations]
gw = "groundwork"

[fact_check]
support_threshold = 0.7

[web_search]
provider = "http"
url = "http://localhost:9000/search"
confidence_threshold = 0.6
cache_ttl_secs = 60
"#,
        )
        .unwrap();
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.retrieval.dense_weight, 0.5);
        assert_eq!(pipeline.abbreviations.get("gw").map(String::as_str), Some("groundwork"));
        assert_eq!(pipeline.fact_check.support_threshold, 0.7);
        assert_eq!(pipeline.fact_check.relaxed_floor, 0.4);
        assert_eq!(pipeline.web_search.confidence_threshold, 0.6);
        assert_eq!(pipeline.web_search.cache_ttl_secs, 60);
        assert_eq!(pipeline.web_search.max_results, 5);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let cases = [
            ("[embedding]\nprovider = \"openai\"\n", "embedding.model"),
            ("[generation]\nprovider = \"anthropic\"\n", "Unknown generation provider"),
            ("[retrieval]\ndense_weight = 1.5\n", "retrieval.dense_weight"),
            ("[rerank]\nprovider = \"http\"\n", "rerank.url"),
            ("[merge]\ncomplementary_floor = 0.9\n", "complementary_floor"),
        ];
        for (section, needle) in cases {
            let src = format!("[db]\npath = \"./gw.sqlite\"\n\n{}", section);
            let err = parse(&src).unwrap_err().to_string();
            assert!(err.contains(needle), "{} -> {}", needle, err);
        }
    }
}
