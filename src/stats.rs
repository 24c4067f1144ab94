//! Database statistics and health overview.
//!
//! Summarizes what is indexed and how the pipeline has been used: stored
//! documents, cached chunks, chat history and per-event metrics counts.
//! Used by `gw stats`.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::{db, migrate};

/// Per-document chunk counts.
struct DocumentStats {
    id: String,
    chunk_count: i64,
    updated_at: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;
    let total_chunks: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(chunk_count), 0) FROM chunk_cache")
        .fetch_one(&pool)
        .await?;
    let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path).map(|m| m.len()).unwrap_or(0);

    println!("Groundwork Database Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);
    println!("  Messages:    {}", total_messages);

    let doc_rows = sqlx::query(
        r#"
        SELECT d.id, COALESCE(c.chunk_count, 0) AS chunk_count, d.updated_at
        FROM documents d
        LEFT JOIN chunk_cache c ON c.document_id = d.id
        ORDER BY d.updated_at DESC, d.id
        LIMIT 20
        "#,
    )
    .fetch_all(&pool)
    .await?;
    let docs: Vec<DocumentStats> = doc_rows
        .iter()
        .map(|row| DocumentStats {
            id: row.get("id"),
            chunk_count: row.get("chunk_count"),
            updated_at: row.get("updated_at"),
        })
        .collect();

    if !docs.is_empty() {
        println!();
        println!("  Recent documents:");
        println!("  {:<48} {:>8}   {}", "DOCUMENT", "CHUNKS", "UPDATED");
        println!("  {}", "-".repeat(76));
        for d in &docs {
            println!(
                "  {:<48} {:>8}   {}",
                truncate(&d.id, 48),
                d.chunk_count,
                format_ts_relative(d.updated_at)
            );
        }
    }

    let event_rows = sqlx::query(
        "SELECT name, COUNT(*) AS n, MAX(created_at) AS last FROM events GROUP BY name ORDER BY n DESC",
    )
    .fetch_all(&pool)
    .await?;
    if !event_rows.is_empty() {
        println!();
        println!("  Events:");
        println!("  {:<24} {:>8}   {}", "EVENT", "COUNT", "LAST");
        println!("  {}", "-".repeat(52));
        for row in &event_rows {
            let name: String = row.get("name");
            let count: i64 = row.get("n");
            let last: i64 = row.get("last");
            println!("  {:<24} {:>8}   {}", name, count, format_ts_relative(last));
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let tail: String = s.chars().rev().take(max - 1).collect::<Vec<_>>().into_iter().rev().collect();
    format!("…{}", tail)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
    }

    #[test]
    fn test_truncate_keeps_tail() {
        assert_eq!(truncate("docs/guide.md", 48), "docs/guide.md");
        assert_eq!(truncate("abcdef", 4), "…def");
    }
}
