//! SQLite-backed implementations of the core storage traits.
//!
//! One [`SqliteStore`] serves as document store, chunk cache and chat
//! history. Metrics go through [`SqliteMetrics`], which queues events on an
//! unbounded channel drained by a background task so that
//! [`MetricsSink::record`] never blocks the query path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use groundwork_core::chunk::content_hash;
use groundwork_core::models::{ChatMessage, ChatRole};
use groundwork_core::store::{CachedChunks, ChatHistoryStore, ChunkCache, DocumentStore, MetricsEvent, MetricsSink};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ids of every stored document, sorted.
    pub async fn document_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn parse_role(role: &str) -> ChatRole {
    match role {
        "assistant" => ChatRole::Assistant,
        _ => ChatRole::User,
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_text(&self, document_id: &str) -> Result<Option<String>> {
        let text = sqlx::query_scalar("SELECT text FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(text)
    }

    async fn put_text(&self, document_id: &str, text: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, text, content_hash, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document_id)
        .bind(text)
        .bind(content_hash(text))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkCache for SqliteStore {
    async fn get(&self, document_id: &str) -> Result<Option<CachedChunks>> {
        let row = sqlx::query("SELECT content_hash, chunks_json FROM chunk_cache WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let chunks_json: String = row.get("chunks_json");
        let chunks = serde_json::from_str(&chunks_json)
            .with_context(|| format!("Corrupt chunk cache entry for {}", document_id))?;
        Ok(Some(CachedChunks {
            content_hash: row.get("content_hash"),
            chunks,
        }))
    }

    async fn put(&self, document_id: &str, entry: CachedChunks) -> Result<()> {
        let chunks_json = serde_json::to_string(&entry.chunks)?;
        sqlx::query(
            r#"
            INSERT INTO chunk_cache (document_id, content_hash, chunk_count, chunks_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                chunks_json = excluded.chunks_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document_id)
        .bind(&entry.content_hash)
        .bind(entry.chunks.len() as i64)
        .bind(chunks_json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_cache WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT document_id FROM chunk_cache ORDER BY document_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl ChatHistoryStore for SqliteStore {
    async fn get_recent(
        &self,
        user_id: &str,
        document_id: Option<&str>,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, document_id, session_id, role, content, timestamp
            FROM chat_messages
            WHERE user_id = ?
              AND (? IS NULL OR document_id = ?)
              AND (? IS NULL OR session_id = ?)
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(document_id)
        .bind(document_id)
        .bind(session_id)
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<ChatMessage> = rows
            .iter()
            .map(|row| {
                let role: String = row.get("role");
                ChatMessage {
                    user_id: row.get("user_id"),
                    document_id: row.get("document_id"),
                    session_id: row.get("session_id"),
                    role: parse_role(&role),
                    content: row.get("content"),
                    timestamp: row.get("timestamp"),
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn append(&self, message: ChatMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_messages (user_id, document_id, session_id, role, content, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.user_id)
        .bind(&message.document_id)
        .bind(&message.session_id)
        .bind(role_str(message.role))
        .bind(&message.content)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn event_query_id(event: &MetricsEvent) -> Option<&str> {
    match event {
        MetricsEvent::QueryProcessed { query_id, .. } | MetricsEvent::Feedback { query_id, .. } => Some(query_id),
        MetricsEvent::DocumentIndexed { .. } => None,
    }
}

async fn write_event(pool: &SqlitePool, event: &MetricsEvent) -> Result<()> {
    sqlx::query("INSERT INTO events (name, query_id, payload_json, created_at) VALUES (?, ?, ?, ?)")
        .bind(event.name())
        .bind(event_query_id(event))
        .bind(serde_json::to_string(event)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(())
}

/// Metrics sink writing events to the `events` table off the query path.
pub struct SqliteMetrics {
    tx: Mutex<Option<mpsc::UnboundedSender<MetricsEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteMetrics {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(pool: SqlitePool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MetricsEvent>();
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = write_event(&pool, &event).await {
                    warn!(event = event.name(), error = %e, "failed to record metrics event");
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Stop accepting events and wait for queued ones to be written.
    pub async fn close(&self) {
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "metrics writer task failed");
            }
        }
    }
}

impl MetricsSink for SqliteMetrics {
    fn record(&self, event: MetricsEvent) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!("metrics writer stopped, dropping event");
                }
            }
            None => warn!(event = event.name(), "metrics sink closed, dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use groundwork_core::models::{Chunk, ContentType};
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("gw.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn chunk(document_id: &str, index: i64, content: &str) -> Chunk {
        Chunk {
            id: format!("{}-{}", document_id, index),
            document_id: document_id.to_string(),
            content: content.to_string(),
            chunk_index: index,
            section_title: None,
            content_type: ContentType::Text,
            programming_language: None,
            embedding: Some(vec![0.6, 0.8]),
            hash: content_hash(content),
            bm25_score: 0.0,
            semantic_score: 0.0,
            rerank_score: 0.0,
            final_score: 0.0,
        }
    }

    #[tokio::test]
    async fn test_document_roundtrip_and_upsert() {
        let (_tmp, store) = store().await;
        store.put_text("a.md", "first").await.unwrap();
        store.put_text("a.md", "second").await.unwrap();
        assert_eq!(store.get_text("a.md").await.unwrap().as_deref(), Some("second"));
        assert_eq!(store.document_ids().await.unwrap(), vec!["a.md".to_string()]);
        DocumentStore::remove(&store, "a.md").await.unwrap();
        assert!(store.get_text("a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunk_cache_keeps_embeddings() {
        let (_tmp, store) = store().await;
        let entry = CachedChunks {
            content_hash: "abc".into(),
            chunks: vec![chunk("a.md", 0, "alpha"), chunk("a.md", 1, "beta")],
        };
        store.put("a.md", entry).await.unwrap();
        let cached = store.get("a.md").await.unwrap().unwrap();
        assert_eq!(cached.content_hash, "abc");
        assert_eq!(cached.chunks.len(), 2);
        assert_eq!(cached.chunks[1].embedding.as_deref(), Some(&[0.6f32, 0.8][..]));
        assert_eq!(ChunkCache::document_ids(&store).await.unwrap(), vec!["a.md".to_string()]);
        ChunkCache::remove(&store, "a.md").await.unwrap();
        assert!(store.get("a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chat_history_filters_and_orders() {
        let (_tmp, store) = store().await;
        for (i, (session, content)) in [("s1", "one"), ("s2", "two"), ("s1", "three"), ("s1", "four")]
            .iter()
            .enumerate()
        {
            store
                .append(ChatMessage {
                    user_id: "u".into(),
                    document_id: Some("doc".into()),
                    session_id: Some(session.to_string()),
                    role: if i % 2 == 0 { ChatRole::User } else { ChatRole::Assistant },
                    content: content.to_string(),
                    timestamp: i as i64,
                })
                .await
                .unwrap();
        }
        let recent = store.get_recent("u", Some("doc"), Some("s1"), 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["three", "four"]);
        assert_eq!(recent[1].role, ChatRole::Assistant);

        let all = store.get_recent("u", None, None, 10).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(store.get_recent("other", None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_are_flushed_on_close() {
        let (_tmp, store) = store().await;
        let metrics = SqliteMetrics::spawn(store.pool().clone());
        metrics.record(MetricsEvent::Feedback {
            query_id: "q1".into(),
            kind: "rating".into(),
            value: "5".into(),
        });
        metrics.close().await;
        metrics.record(MetricsEvent::Feedback {
            query_id: "q2".into(),
            kind: "rating".into(),
            value: "1".into(),
        });

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE name = 'feedback'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
