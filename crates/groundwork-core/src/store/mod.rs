//! Storage collaborators for the groundwork pipeline.
//!
//! The core never owns persistence. Chat history, raw document text, the
//! incremental chunk cache and metrics events are all delegated to the
//! traits defined here, so the application can plug in SQLite (see the
//! `groundwork` crate) while tests use [`memory`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, Chunk};

/// Persisted chat turns, newest last.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Most recent `limit` messages for the user, optionally narrowed to a
    /// document and session, returned oldest first.
    async fn get_recent(
        &self,
        user_id: &str,
        document_id: Option<&str>,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;

    async fn append(&self, message: ChatMessage) -> Result<()>;
}

/// Raw extracted document text, keyed by document id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_text(&self, document_id: &str) -> Result<Option<String>>;
    async fn put_text(&self, document_id: &str, text: &str) -> Result<()>;
    async fn remove(&self, document_id: &str) -> Result<()>;
}

/// A document's chunk set together with the hash of the text it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedChunks {
    /// SHA-256 of the full document text.
    pub content_hash: String,
    pub chunks: Vec<Chunk>,
}

/// Key-value store backing incremental re-indexing.
#[async_trait]
pub trait ChunkCache: Send + Sync {
    async fn get(&self, document_id: &str) -> Result<Option<CachedChunks>>;
    async fn put(&self, document_id: &str, entry: CachedChunks) -> Result<()>;
    async fn remove(&self, document_id: &str) -> Result<()>;
    async fn document_ids(&self) -> Result<Vec<String>>;
}

/// Observability events emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricsEvent {
    QueryProcessed {
        query_id: String,
        document_id: Option<String>,
        confidence: f64,
        confidence_level: String,
        merge_strategy: String,
        web_search_triggered: bool,
        total_ms: u64,
    },
    DocumentIndexed {
        document_id: String,
        chunks_created: usize,
        status: String,
    },
    Feedback {
        query_id: String,
        kind: String,
        value: String,
    },
}

impl MetricsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MetricsEvent::QueryProcessed { .. } => "query_processed",
            MetricsEvent::DocumentIndexed { .. } => "document_indexed",
            MetricsEvent::Feedback { .. } => "feedback",
        }
    }
}

/// Fire-and-forget event sink.
///
/// `record` is synchronous and infallible: implementations hand the event
/// off (channel, spawned task) and swallow their own errors.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricsEvent);
}

/// Sink that drops every event.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricsEvent) {}
}
