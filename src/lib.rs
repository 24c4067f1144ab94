//! # Groundwork
//!
//! A local-first question answering tool over your own documents.
//!
//! The retrieval and answer pipeline lives in the `groundwork-core` crate;
//! this crate supplies everything around it: TOML configuration, SQLite
//! persistence, HTTP providers and the `gw` CLI.
//!
//! ```text
//! ┌────────────┐   ┌───────────────────────────┐   ┌──────────┐
//! │  gw index  │──▶│ chunk → embed → hybrid idx │──▶│  SQLite  │
//! └────────────┘   └───────────────────────────┘   └────┬─────┘
//!                                                      │ warm start
//! ┌────────────┐   ┌───────────────────────────┐        │
//! │   gw ask   │──▶│ retrieve → rerank → answer │◀───────┘
//! └────────────┘   │ → fact-check → web → merge │
//!                  └───────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`], [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Document, chunk cache, history and metrics stores |
//! | [`http`] | JSON POST with retry and backoff |
//! | [`embedding`], [`generation`], [`rerank`], [`web_search`] | Network providers |
//! | [`services`] | Pipeline assembly |
//! | [`ingest`], [`ask`], [`stats`] | CLI commands |
//! | [`logging`] | `tracing` subscriber setup |

pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod rerank;
pub mod services;
pub mod sqlite_store;
pub mod stats;
pub mod web_search;
