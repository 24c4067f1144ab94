//! In-memory BM25 index over chunk content.

use std::collections::HashMap;

use crate::text;

#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

struct DocTerms {
    tf: HashMap<String, u32>,
    len: usize,
}

/// Term-frequency index keyed by chunk id.
pub struct Bm25Index {
    params: Bm25Params,
    docs: HashMap<String, DocTerms>,
    df: HashMap<String, usize>,
    total_len: usize,
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            docs: HashMap::new(),
            df: HashMap::new(),
            total_len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.df.len()
    }

    /// Index `content` under `chunk_id`, replacing any previous entry.
    pub fn insert(&mut self, chunk_id: &str, content: &str) {
        self.remove(chunk_id);
        let terms = text::terms(content);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for term in &terms {
            *tf.entry(term.clone()).or_insert(0) += 1;
        }
        for term in tf.keys() {
            *self.df.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_len += terms.len();
        self.docs.insert(
            chunk_id.to_string(),
            DocTerms {
                tf,
                len: terms.len(),
            },
        );
    }

    pub fn remove(&mut self, chunk_id: &str) {
        let Some(doc) = self.docs.remove(chunk_id) else {
            return;
        };
        self.total_len -= doc.len;
        for term in doc.tf.keys() {
            if let Some(count) = self.df.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.df.remove(term);
                }
            }
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Raw BM25 score for every chunk that contains at least one query term.
    /// Unsorted.
    pub fn scores(&self, query: &str) -> Vec<(String, f64)> {
        if self.docs.is_empty() {
            return Vec::new();
        }
        let mut query_terms = text::terms(query);
        query_terms.sort();
        query_terms.dedup();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let avgdl = (self.total_len as f64 / self.docs.len() as f64).max(1.0);
        let idfs: Vec<(&str, f64)> = query_terms
            .iter()
            .filter(|t| self.df.contains_key(t.as_str()))
            .map(|t| (t.as_str(), self.idf(t)))
            .collect();

        let Bm25Params { k1, b } = self.params;
        self.docs
            .iter()
            .filter_map(|(id, doc)| {
                let mut score = 0.0;
                for (term, idf) in &idfs {
                    let Some(&tf) = doc.tf.get(*term) else {
                        continue;
                    };
                    let tf = tf as f64;
                    let norm = 1.0 - b + b * doc.len as f64 / avgdl;
                    score += idf * tf * (k1 + 1.0) / (tf + k1 * norm);
                }
                (score > 0.0).then(|| (id.clone(), score))
            })
            .collect()
    }
}
