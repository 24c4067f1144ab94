//! Query → ranked, deduplicated passages.
//!
//! `search(top_k × candidate_multiplier)` on the [`HybridIndex`] (which
//! expands abbreviations and applies the document filter), dedupe by chunk
//! id and by identical content, then rerank down to `top_k`. Pure with
//! respect to index state: nothing here mutates the index.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{stage, PipelineError, Result};
use crate::index::{DocumentFilter, HybridIndex, SearchRequest, SearchStatus};
use crate::models::RetrievalResult;
use crate::rerank::{RerankStatus, Reranker};

#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub candidate_multiplier: usize,
    pub dense_weight: f64,
    pub sparse_weight: f64,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            candidate_multiplier: 3,
            dense_weight: 0.7,
            sparse_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Retrieval {
    pub results: Vec<RetrievalResult>,
    pub status: SearchStatus,
    pub rerank: RerankStatus,
    /// Candidates returned by the index before dedupe and rerank.
    pub candidates: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSummary {
    pub candidates: usize,
    pub returned: usize,
    pub status: SearchStatus,
    pub rerank: RerankStatus,
}

impl Retrieval {
    pub fn summary(&self) -> RetrievalSummary {
        RetrievalSummary {
            candidates: self.candidates,
            returned: self.results.len(),
            status: self.status,
            rerank: self.rerank,
        }
    }

    /// Fused (pre-rerank) scores, in result order.
    pub fn retrieval_scores(&self) -> Vec<f64> {
        self.results
            .iter()
            .map(|r| r.metadata.original_score.unwrap_or(r.score))
            .collect()
    }

    /// Rerank scores, when reranking was applied.
    pub fn rerank_scores(&self) -> Option<Vec<f64>> {
        let scores: Vec<f64> = self
            .results
            .iter()
            .filter_map(|r| r.metadata.rerank_score)
            .collect();
        (!scores.is_empty()).then_some(scores)
    }
}

pub struct Retriever {
    index: Arc<HybridIndex>,
    reranker: Reranker,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(index: Arc<HybridIndex>, reranker: Reranker, params: RetrievalParams) -> Self {
        Self {
            index,
            reranker,
            params,
        }
    }

    pub fn index(&self) -> &Arc<HybridIndex> {
        &self.index
    }

    pub async fn retrieve(&self, query: &str, top_k: usize, filter: Option<&DocumentFilter>) -> Result<Retrieval> {
        let candidates_k = top_k.saturating_mul(self.params.candidate_multiplier.max(1));
        let search = self
            .index
            .search(&SearchRequest {
                query,
                top_k: candidates_k,
                dense_weight: self.params.dense_weight,
                sparse_weight: self.params.sparse_weight,
                filter,
            })
            .await
            .map_err(|e| PipelineError::provider(stage::RETRIEVE, e))?;

        let candidates = search.results.len();
        let unique = dedupe(search.results);
        let (results, rerank) = self.reranker.rerank(query, unique, top_k).await;

        Ok(Retrieval {
            results,
            status: search.status,
            rerank,
            candidates,
        })
    }
}

/// Drop repeated chunk ids and repeated content, keeping the first
/// (highest-scoring) occurrence.
fn dedupe(results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_content: HashSet<String> = HashSet::new();
    results
        .into_iter()
        .filter(|r| {
            seen_ids.insert(r.metadata.chunk_id.clone())
                && seen_content.insert(crate::text::normalize(&r.content))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunker, ChunkingConfig};
    use crate::embedding::HashingEmbedder;
    use crate::expand::QueryExpander;
    use crate::index::FusionParams;
    use crate::models::ResultMetadata;
    use crate::store::memory::InMemoryChunkCache;
    use std::collections::BTreeMap;

    fn result(id: &str, content: &str, score: f64) -> RetrievalResult {
        RetrievalResult {
            document_id: "d".into(),
            content: content.into(),
            score,
            chunk_index: 0,
            metadata: ResultMetadata {
                chunk_id: id.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_dedupe_by_id_and_content() {
        let out = dedupe(vec![
            result("1", "Same  text", 0.9),
            result("1", "other", 0.8),
            result("2", "same text", 0.7),
            result("3", "different", 0.6),
        ]);
        let ids: Vec<&str> = out.iter().map(|r| r.metadata.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    async fn retriever() -> Retriever {
        let index = Arc::new(HybridIndex::new(
            Arc::new(HashingEmbedder::new(256)),
            QueryExpander::default(),
            FusionParams::default(),
        ));
        let chunker = Chunker::new(Arc::new(InMemoryChunkCache::new()), ChunkingConfig::default());
        for (id, text) in [
            ("a", "Lifetimes describe how long references stay valid."),
            ("b", "Traits define shared behavior across types."),
            ("c", "Lifetimes and traits combine in generic bounds."),
        ] {
            index.index(id, chunker.split(id, text, &BTreeMap::new())).await.unwrap();
        }
        Retriever::new(index, Reranker::disabled(), RetrievalParams::default())
    }

    #[tokio::test]
    async fn test_retrieve_top_k_and_idempotent() {
        let r = retriever().await;
        let first = r.retrieve("lifetimes references", 2, None).await.unwrap();
        let second = r.retrieve("lifetimes references", 2, None).await.unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.results[0].document_id, "a");
        let a: Vec<&str> = first.results.iter().map(|x| x.metadata.chunk_id.as_str()).collect();
        let b: Vec<&str> = second.results.iter().map(|x| x.metadata.chunk_id.as_str()).collect();
        assert_eq!(a, b);
        assert_eq!(first.rerank, RerankStatus::Skipped);
        assert!(first.rerank_scores().is_none());
    }

    #[tokio::test]
    async fn test_retrieve_with_document_filter() {
        let r = retriever().await;
        let filter = DocumentFilter::document("b");
        let out = r.retrieve("lifetimes", 3, Some(&filter)).await.unwrap();
        assert!(out.results.iter().all(|x| x.document_id == "b"));
    }
}
