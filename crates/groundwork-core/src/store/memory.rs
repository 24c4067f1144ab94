//! In-memory store implementations for tests and embedded use.
//!
//! Everything lives in `HashMap`/`Vec` behind `std::sync::RwLock`. Locks
//! are never held across an await point.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ChatMessage;

use super::{
    CachedChunks, ChatHistoryStore, ChunkCache, DocumentStore, MetricsEvent, MetricsSink,
};

/// In-memory chat history.
#[derive(Default)]
pub struct InMemoryChatHistory {
    messages: RwLock<Vec<ChatMessage>>,
}

impl InMemoryChatHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatHistoryStore for InMemoryChatHistory {
    async fn get_recent(
        &self,
        user_id: &str,
        document_id: Option<&str>,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<&ChatMessage> = messages
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter(|m| document_id.is_none() || m.document_id.as_deref() == document_id)
            .filter(|m| session_id.is_none() || m.session_id.as_deref() == session_id)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    async fn append(&self, message: ChatMessage) -> Result<()> {
        self.messages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

/// In-memory document text store.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<String, String>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_text(&self, document_id: &str) -> Result<Option<String>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(document_id).cloned())
    }

    async fn put_text(&self, document_id: &str, text: &str) -> Result<()> {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.to_string(), text.to_string());
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(document_id);
        Ok(())
    }
}

/// In-memory chunk cache.
#[derive(Default)]
pub struct InMemoryChunkCache {
    entries: RwLock<HashMap<String, CachedChunks>>,
}

impl InMemoryChunkCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkCache for InMemoryChunkCache {
    async fn get(&self, document_id: &str) -> Result<Option<CachedChunks>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(document_id).cloned())
    }

    async fn put(&self, document_id: &str, entry: CachedChunks) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(document_id);
        Ok(())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Metrics sink that keeps every event, for assertions in tests.
#[derive(Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricsEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricsEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, event: MetricsEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
