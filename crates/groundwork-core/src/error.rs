//! Error taxonomy for the query and indexing pipeline.
//!
//! Collaborator traits return [`anyhow::Result`]; the pipeline classifies
//! those failures into [`PipelineError`] so that each stage can decide
//! whether to degrade (drop a candidate, skip reranking, answer
//! local-only) or, for configuration problems only, refuse to start.

use thiserror::Error;

/// Pipeline stage names used in [`PipelineError::Provider`].
pub mod stage {
    pub const EMBED: &str = "embed";
    pub const GENERATE: &str = "generate";
    pub const RERANK: &str = "rerank";
    pub const WEB_SEARCH: &str = "web_search";
    pub const RETRIEVE: &str = "retrieve";
    pub const FACT_CHECK: &str = "fact_check";
    pub const HISTORY: &str = "history";
    pub const DOCUMENTS: &str = "documents";
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// An embedding, generation, rerank or web-search call failed or timed out.
    #[error("{stage} provider failed: {message}")]
    Provider {
        stage: &'static str,
        message: String,
    },
    /// The document has no usable text, or retrieval came back empty.
    #[error("insufficient content: {0}")]
    InsufficientContent(String),
    /// A generated answer failed the quality heuristics.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Missing credentials, unknown provider, invalid weights.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn provider(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Provider {
            stage,
            message: err.to_string(),
        }
    }

    /// Everything except configuration errors is handled inside the query.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
