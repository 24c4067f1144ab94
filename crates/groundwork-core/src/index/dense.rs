//! Brute-force inner-product index over L2-normalized vectors.

use std::collections::HashMap;

use crate::embedding::{dot, l2_normalize};

#[derive(Default)]
pub struct DenseIndex {
    vectors: HashMap<String, Vec<f32>>,
    dims: Option<usize>,
}

impl DenseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    /// Store a copy of `vector`, normalized. The first vector fixes the
    /// dimensionality; mismatched vectors are rejected.
    pub fn insert(&mut self, chunk_id: &str, vector: &[f32]) -> bool {
        if vector.is_empty() {
            return false;
        }
        match self.dims {
            Some(d) if d != vector.len() => return false,
            _ => self.dims = Some(vector.len()),
        }
        let mut v = vector.to_vec();
        l2_normalize(&mut v);
        self.vectors.insert(chunk_id.to_string(), v);
        true
    }

    pub fn remove(&mut self, chunk_id: &str) {
        self.vectors.remove(chunk_id);
        if self.vectors.is_empty() {
            self.dims = None;
        }
    }

    /// Cosine similarity of every stored vector against `query`. Unsorted.
    pub fn scores(&self, query: &[f32]) -> Vec<(String, f64)> {
        if self.dims != Some(query.len()) {
            return Vec::new();
        }
        let mut q = query.to_vec();
        l2_normalize(&mut q);
        self.vectors
            .iter()
            .map(|(id, v)| (id.clone(), dot(&q, v) as f64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_are_cosine() {
        let mut idx = DenseIndex::new();
        idx.insert("x", &[2.0, 0.0]);
        idx.insert("y", &[0.0, 3.0]);
        let scores: HashMap<String, f64> = idx.scores(&[1.0, 0.0]).into_iter().collect();
        assert!((scores["x"] - 1.0).abs() < 1e-6);
        assert!(scores["y"].abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut idx = DenseIndex::new();
        assert!(idx.insert("x", &[1.0, 0.0]));
        assert!(!idx.insert("y", &[1.0, 0.0, 0.0]));
        assert!(idx.scores(&[1.0, 0.0, 0.0]).is_empty());
    }

    #[test]
    fn test_remove_last_resets_dims() {
        let mut idx = DenseIndex::new();
        idx.insert("x", &[1.0, 0.0]);
        idx.remove("x");
        assert_eq!(idx.dims(), None);
        assert!(idx.insert("y", &[1.0, 0.0, 0.0]));
    }
}
