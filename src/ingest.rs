//! `gw index`: walk a file or directory and index every matching file.
//!
//! Document ids are paths relative to the indexed root, with `/`
//! separators, so re-indexing the same tree updates documents in place.
//! Unchanged files are detected by content hash inside the pipeline and
//! cost nothing; `--full` forces re-chunking and re-embedding.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use groundwork_core::chunk::Chunker;
use groundwork_core::pipeline::IndexStatus;
use groundwork_core::store::memory::InMemoryChunkCache;

use crate::config::{Config, DocumentsConfig};
use crate::services::Services;

/// A file selected for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub document_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct IndexCounters {
    pub indexed: usize,
    pub unchanged: usize,
    pub empty: usize,
    pub failed: usize,
    pub skipped: usize,
    pub chunks: usize,
}

pub async fn run_index(config: &Config, path: &Path, full: bool, dry_run: bool) -> Result<()> {
    let (files, skipped) = scan(path, &config.documents)?;

    if dry_run {
        let chunker = Chunker::new(Arc::new(InMemoryChunkCache::new()), config.chunking.clone());
        let mut estimated = 0usize;
        for file in &files {
            if let Some(text) = read_text(&file.path) {
                estimated += chunker.split(&file.document_id, &text, &file_metadata(&file.path)).len();
            }
        }
        println!("index {} (dry-run)", path.display());
        println!("  files found: {}", files.len());
        println!("  skipped: {}", skipped);
        println!("  estimated chunks: {}", estimated);
        return Ok(());
    }

    let services = Services::open(config, true).await?;
    let mut counters = IndexCounters {
        skipped,
        ..Default::default()
    };

    for file in &files {
        let Some(text) = read_text(&file.path) else {
            counters.skipped += 1;
            continue;
        };
        let report = services
            .pipeline
            .index_document_with_metadata(&file.document_id, &text, &file_metadata(&file.path), full)
            .await;
        debug!(document_id = %file.document_id, status = report.status.as_str(), "indexed file");
        match report.status {
            IndexStatus::Indexed => {
                counters.indexed += 1;
                counters.chunks += report.chunks_created;
            }
            IndexStatus::Unchanged => counters.unchanged += 1,
            IndexStatus::Empty => counters.empty += 1,
            IndexStatus::Failed => {
                counters.failed += 1;
                eprintln!(
                    "  failed: {} ({})",
                    file.document_id,
                    report.message.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    let stats = services.pipeline.stats();
    services.shutdown().await;

    println!("index {}", path.display());
    println!("  files found: {}", files.len());
    println!("  indexed: {}", counters.indexed);
    println!("  unchanged: {}", counters.unchanged);
    println!("  empty: {}", counters.empty);
    println!("  skipped: {}", counters.skipped);
    println!("  failed: {}", counters.failed);
    println!("  chunks written: {}", counters.chunks);
    println!("  index total: {} documents, {} chunks", stats.documents, stats.chunks);
    if counters.failed > 0 {
        bail!("{} file(s) failed to index", counters.failed);
    }
    println!("ok");
    Ok(())
}

/// Collect indexable files under `root`, sorted by document id.
/// Returns the files and the number skipped for size.
pub fn scan(root: &Path, config: &DocumentsConfig) -> Result<(Vec<SourceFile>, usize)> {
    if !root.exists() {
        bail!("Path does not exist: {}", root.display());
    }

    // A single file is indexed regardless of the include globs.
    if root.is_file() {
        let document_id = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        if file_too_large(root, config.max_file_bytes) {
            return Ok((Vec::new(), 1));
        }
        return Ok((
            vec![SourceFile {
                document_id,
                path: root.to_path_buf(),
            }],
            0,
        ));
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    let mut skipped = 0usize;
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        if file_too_large(path, config.max_file_bytes) {
            debug!(path = %rel_str, "skipping oversized file");
            skipped += 1;
            continue;
        }
        files.push(SourceFile {
            document_id: rel_str,
            path: path.to_path_buf(),
        });
    }

    files.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    Ok((files, skipped))
}

fn file_too_large(path: &Path, max_bytes: u64) -> bool {
    std::fs::metadata(path).map(|m| m.len() > max_bytes).unwrap_or(false)
}

/// File contents as UTF-8, or `None` (logged) for binary or unreadable files.
fn read_text(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable file");
            None
        }
    }
}

/// Chunker hints: file name as title, language from the extension.
fn file_metadata(path: &Path) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    if let Some(name) = path.file_name() {
        metadata.insert("title".to_string(), name.to_string_lossy().to_string());
    }
    let language = match path.extension().and_then(|e| e.to_str()) {
        Some("rs") => Some("rust"),
        Some("py") => Some("python"),
        Some("js" | "mjs" | "jsx") => Some("javascript"),
        Some("ts" | "tsx") => Some("typescript"),
        Some("go") => Some("go"),
        Some("java") => Some("java"),
        Some("c" | "h") => Some("c"),
        Some("cpp" | "cc" | "hpp") => Some("cpp"),
        _ => None,
    };
    if let Some(language) = language {
        metadata.insert("language".to_string(), language.to_string());
    }
    metadata
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
