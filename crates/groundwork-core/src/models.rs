//! Core data models shared across the groundwork pipeline.
//!
//! [`Chunk`]s are owned by the hybrid index; everything else here lives
//! for the duration of a single query.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content classification of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Code,
    Mixed,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Code => "code",
            ContentType::Mixed => "mixed",
        }
    }
}

/// A chunk of a document, plus transient per-query scores.
///
/// Content is immutable once created. The four score fields are reset and
/// recomputed on every search; they are never persisted meaningfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: i64,
    pub section_title: Option<String>,
    pub content_type: ContentType,
    pub programming_language: Option<String>,
    /// L2-normalized once the chunk has been indexed.
    pub embedding: Option<Vec<f32>>,
    /// SHA-256 of `content`.
    pub hash: String,
    #[serde(default)]
    pub bm25_score: f64,
    #[serde(default)]
    pub semantic_score: f64,
    #[serde(default)]
    pub rerank_score: f64,
    #[serde(default)]
    pub final_score: f64,
}

/// Chunk-level details carried alongside a [`RetrievalResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub chunk_id: String,
    pub section_title: Option<String>,
    pub content_type: Option<ContentType>,
    pub programming_language: Option<String>,
    /// Clamped dense score that went into the fusion.
    pub dense_score: f64,
    /// Divisor-normalized sparse score that went into the fusion.
    pub sparse_score: f64,
    /// Score before reranking, when the result was reranked.
    pub original_score: Option<f64>,
    pub rerank_score: Option<f64>,
}

/// Read-only projection of a chunk with a query-specific score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub document_id: String,
    pub content: String,
    pub score: f64,
    pub chunk_index: i64,
    pub metadata: ResultMetadata,
}

impl RetrievalResult {
    pub fn from_chunk(chunk: &Chunk, score: f64) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            content: chunk.content.clone(),
            score,
            chunk_index: chunk.chunk_index,
            metadata: ResultMetadata {
                chunk_id: chunk.id.clone(),
                section_title: chunk.section_title.clone(),
                content_type: Some(chunk.content_type),
                programming_language: chunk.programming_language.clone(),
                ..Default::default()
            },
        }
    }
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Local,
    Web,
    Merged,
}

/// The unit exchanged between the generator / web fallback and the merger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSource {
    pub content: String,
    pub confidence: f64,
    pub source_type: SourceType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AnswerSource {
    pub fn local(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source_type: SourceType::Local,
            metadata: BTreeMap::new(),
        }
    }

    pub fn web(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source_type: SourceType::Web,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of persisted chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: String,
    pub document_id: Option<String>,
    pub session_id: Option<String>,
    pub role: ChatRole,
    pub content: String,
    /// Unix seconds.
    pub timestamp: i64,
}
