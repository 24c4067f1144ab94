//! # Groundwork Core
//!
//! Retrieval-augmented question answering over a private corpus: chunking,
//! a hybrid dense + BM25 index, cross-encoder reranking, answer generation
//! with best-of-n sampling, and the quality-control stages that decide how
//! much of a generated answer to trust (validation, sentence-level fact
//! checking, confidence scoring, web fallback and merging).
//!
//! This crate owns no I/O. Embedding, generation, reranking and web search
//! are reached through the traits in [`embedding`] and [`providers`];
//! persistence goes through the traits in [`store`]. The `groundwork`
//! binary wires concrete HTTP and SQLite implementations into a
//! [`pipeline::RagPipeline`].

pub mod chunk;
pub mod confidence;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod factcheck;
pub mod format;
pub mod generate;
pub mod index;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod question;
pub mod rerank;
pub mod retrieve;
pub mod store;
pub mod text;
pub mod validate;
pub mod websearch;

pub use pipeline::{PipelineConfig, PipelineServices, QueryRequest, QueryResponse, RagPipeline};
