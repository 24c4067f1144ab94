//! Hybrid dense + sparse index.
//!
//! Two parallel structures are kept over the same chunk set: a
//! [`DenseIndex`](dense::DenseIndex) of L2-normalized embeddings and a
//! [`Bm25Index`](sparse::Bm25Index) over tokenized content.
//!
//! # Fusion
//!
//! 1. Expand known abbreviations in the query ([`QueryExpander`]).
//! 2. Score every chunk on both sides.
//! 3. Deduplicate by chunk id, keeping the max dense and max sparse score.
//! 4. Normalize: `dense` clamped to `[0, 1]`, `sparse / sparse_divisor`
//!    clamped to `[0, 1]`.
//! 5. `score = dense_weight × dense + sparse_weight × sparse`.
//! 6. Apply the optional [`DocumentFilter`], sort by score (desc) then
//!    chunk id (asc), truncate to `top_k`.
//!
//! # Concurrency
//!
//! Writers (`index`, `remove`) are serialized by an async writer gate that
//! is held across the embedding call; the state lock itself is only taken
//! for the final swap, so queries never wait on an embedding provider.

pub mod dense;
pub mod sparse;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use futures::lock::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::expand::QueryExpander;
use crate::models::{Chunk, ContentType, RetrievalResult};

use dense::DenseIndex;
use sparse::{Bm25Index, Bm25Params};

const EMBED_BATCH_SIZE: usize = 64;

/// Fusion tuning, decoupled from application config.
#[derive(Debug, Clone)]
pub struct FusionParams {
    /// Raw BM25 scores are divided by this before clamping.
    pub sparse_divisor: f64,
    pub bm25: Bm25Params,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            sparse_divisor: 10.0,
            bm25: Bm25Params::default(),
        }
    }
}

/// Restricts search results by document and/or content type.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub document_id: Option<String>,
    pub content_type: Option<ContentType>,
}

impl DocumentFilter {
    pub fn document(id: impl Into<String>) -> Self {
        Self {
            document_id: Some(id.into()),
            content_type: None,
        }
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.document_id
            .as_deref()
            .map_or(true, |id| chunk.document_id == id)
            && self.content_type.map_or(true, |t| chunk.content_type == t)
    }
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub top_k: usize,
    pub dense_weight: f64,
    pub sparse_weight: f64,
    pub filter: Option<&'a DocumentFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Nothing has been indexed yet.
    NoIndex,
    Ok,
    /// The query embedding failed; results are lexical only.
    SparseOnly,
}

#[derive(Debug, Clone)]
pub struct IndexSearch {
    pub results: Vec<RetrievalResult>,
    pub status: SearchStatus,
    pub expanded_query: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub vocabulary: usize,
    pub version: u64,
}

/// One fused candidate, before the chunk is looked up.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedScore {
    pub chunk_id: String,
    pub dense: f64,
    pub sparse: f64,
    pub score: f64,
}

/// Weighted fusion of dense and sparse hit lists.
///
/// Either list may contain the same chunk more than once; the max score per
/// side wins. Chunks missing from one side score 0 there.
pub fn fuse_scores(
    dense: &[(String, f64)],
    sparse: &[(String, f64)],
    dense_weight: f64,
    sparse_weight: f64,
    sparse_divisor: f64,
) -> Vec<FusedScore> {
    let mut best: HashMap<&str, (f64, f64)> = HashMap::new();
    for (id, score) in dense {
        let entry = best.entry(id.as_str()).or_insert((f64::MIN, f64::MIN));
        entry.0 = entry.0.max(*score);
    }
    for (id, score) in sparse {
        let entry = best.entry(id.as_str()).or_insert((f64::MIN, f64::MIN));
        entry.1 = entry.1.max(*score);
    }

    let divisor = if sparse_divisor > 0.0 { sparse_divisor } else { 1.0 };
    let mut fused: Vec<FusedScore> = best
        .into_iter()
        .map(|(id, (d, s))| {
            let d = if d == f64::MIN { 0.0 } else { d.clamp(0.0, 1.0) };
            let s = if s == f64::MIN {
                0.0
            } else {
                (s / divisor).clamp(0.0, 1.0)
            };
            FusedScore {
                chunk_id: id.to_string(),
                dense: d,
                sparse: s,
                score: dense_weight * d + sparse_weight * s,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused
}

struct IndexState {
    chunks: HashMap<String, Chunk>,
    by_document: HashMap<String, Vec<String>>,
    dense: DenseIndex,
    sparse: Bm25Index,
}

impl IndexState {
    fn remove_document(&mut self, document_id: &str) -> usize {
        let Some(ids) = self.by_document.remove(document_id) else {
            return 0;
        };
        for id in &ids {
            self.chunks.remove(id);
            self.dense.remove(id);
            self.sparse.remove(id);
        }
        ids.len()
    }
}

/// Read-mostly hybrid index shared by every query.
pub struct HybridIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    expander: QueryExpander,
    params: FusionParams,
    state: RwLock<IndexState>,
    version: AtomicU64,
    writer: Mutex<()>,
}

impl HybridIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, expander: QueryExpander, params: FusionParams) -> Self {
        let bm25 = params.bm25;
        Self {
            embedder,
            expander,
            params,
            state: RwLock::new(IndexState {
                chunks: HashMap::new(),
                by_document: HashMap::new(),
                dense: DenseIndex::new(),
                sparse: Bm25Index::new(bm25),
            }),
            version: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    pub fn expander(&self) -> &QueryExpander {
        &self.expander
    }

    /// Incremented on every successful write.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.read().chunks.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.read();
        IndexStats {
            documents: state.by_document.len(),
            chunks: state.chunks.len(),
            vocabulary: state.sparse.vocabulary_size(),
            version: self.version(),
        }
    }

    pub fn contains_document(&self, document_id: &str) -> bool {
        self.read().by_document.contains_key(document_id)
    }

    /// Chunks of one document, in index order.
    pub fn document_chunks(&self, document_id: &str) -> Vec<Chunk> {
        let state = self.read();
        let mut chunks: Vec<Chunk> = state
            .by_document
            .get(document_id)
            .map(|ids| ids.iter().filter_map(|id| state.chunks.get(id).cloned()).collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        chunks
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace all chunks of `document_id`.
    ///
    /// Chunks without an embedding (or with one of the wrong dimensionality)
    /// are embedded first. Returns the stored chunks with normalized
    /// embeddings, ready for the chunk cache.
    pub async fn index(&self, document_id: &str, mut chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
        let _gate = self.writer.lock().await;

        let dims = self.embedder.dims();
        let missing: Vec<usize> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.embedding.as_ref().map_or(true, |e| e.len() != dims))
            .map(|(i, _)| i)
            .collect();

        for batch in missing.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].content.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .with_context(|| format!("Failed to embed chunks for document {}", document_id))?;
            if vectors.len() != texts.len() {
                anyhow::bail!(
                    "Embedding provider returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                );
            }
            for (&i, vector) in batch.iter().zip(vectors) {
                chunks[i].embedding = Some(vector);
            }
        }
        for chunk in chunks.iter_mut() {
            if let Some(e) = chunk.embedding.as_mut() {
                crate::embedding::l2_normalize(e);
            }
        }

        {
            let mut state = self.write();
            state.remove_document(document_id);
            let mut ids = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                if let Some(e) = &chunk.embedding {
                    if !state.dense.insert(&chunk.id, e) {
                        warn!(
                            document_id,
                            chunk_id = %chunk.id,
                            "embedding dimension mismatch, chunk is lexical-only"
                        );
                    }
                }
                state.sparse.insert(&chunk.id, &chunk.content);
                state.chunks.insert(chunk.id.clone(), chunk.clone());
                ids.push(chunk.id.clone());
            }
            if !ids.is_empty() {
                state.by_document.insert(document_id.to_string(), ids);
            }
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        debug!(document_id, chunks = chunks.len(), "document indexed");
        Ok(chunks)
    }

    /// Drop every chunk of `document_id`. Returns how many were removed.
    pub async fn remove(&self, document_id: &str) -> usize {
        let _gate = self.writer.lock().await;
        let removed = self.write().remove_document(document_id);
        if removed > 0 {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Hybrid search. An empty index yields [`SearchStatus::NoIndex`].
    pub async fn search(&self, req: &SearchRequest<'_>) -> Result<IndexSearch> {
        if self.is_empty() {
            return Ok(IndexSearch {
                results: Vec::new(),
                status: SearchStatus::NoIndex,
                expanded_query: req.query.to_string(),
            });
        }
        let expanded = self.expander.expand(req.query);
        if req.query.trim().is_empty() || req.top_k == 0 {
            return Ok(IndexSearch {
                results: Vec::new(),
                status: SearchStatus::Ok,
                expanded_query: expanded,
            });
        }

        let query_vec = match self.embedder.embed_one(&expanded).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "query embedding failed, falling back to sparse-only search");
                None
            }
        };

        let state = self.read();
        let dense_hits = query_vec
            .as_deref()
            .map(|q| state.dense.scores(q))
            .unwrap_or_default();
        let sparse_hits = state.sparse.scores(&expanded);

        let fused = fuse_scores(
            &dense_hits,
            &sparse_hits,
            req.dense_weight,
            req.sparse_weight,
            self.params.sparse_divisor,
        );

        let results: Vec<RetrievalResult> = fused
            .into_iter()
            .filter_map(|f| state.chunks.get(&f.chunk_id).map(|c| (f, c)))
            .filter(|(_, c)| req.filter.map_or(true, |flt| flt.matches(c)))
            .take(req.top_k)
            .map(|(f, chunk)| {
                let mut r = RetrievalResult::from_chunk(chunk, f.score);
                r.metadata.dense_score = f.dense;
                r.metadata.sparse_score = f.sparse;
                r
            })
            .collect();

        debug!(
            query = req.query,
            dense = dense_hits.len(),
            sparse = sparse_hits.len(),
            returned = results.len(),
            "hybrid search"
        );

        Ok(IndexSearch {
            results,
            status: if query_vec.is_some() {
                SearchStatus::Ok
            } else {
                SearchStatus::SparseOnly
            },
            expanded_query: expanded,
        })
    }
}
