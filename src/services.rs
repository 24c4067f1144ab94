//! Assemble a [`RagPipeline`] from configuration.
//!
//! Opens the database, applies migrations, builds every configured
//! provider and wires the SQLite stores into the pipeline. Call
//! [`Services::shutdown`] before exit so queued metrics events reach disk.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use groundwork_core::{PipelineServices, RagPipeline};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::rerank::create_cross_encoder;
use crate::sqlite_store::{SqliteMetrics, SqliteStore};
use crate::web_search::create_web_search;
use crate::{db, migrate};

pub struct Services {
    pub pipeline: RagPipeline,
    pub store: SqliteStore,
    metrics: Arc<SqliteMetrics>,
}

impl Services {
    /// Build the pipeline. With `warm`, restore the in-memory index from
    /// the chunk cache (needed by every command that queries).
    pub async fn open(config: &Config, warm: bool) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store = SqliteStore::new(pool.clone());
        let metrics = Arc::new(SqliteMetrics::spawn(pool));

        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation, None)?;
        let judge = match config.generation.judge_model.as_deref() {
            Some(model) => create_generator(&config.generation, Some(model))?,
            None => None,
        };
        debug!(
            embedder = embedder.model_name(),
            generator = ?generator.as_ref().map(|g| g.model_name().to_string()),
            rerank = %config.rerank.provider,
            web_search = %config.web_search.provider,
            "providers configured"
        );

        let services = PipelineServices {
            embedder,
            generator,
            judge,
            cross_encoder: create_cross_encoder(&config.rerank)?,
            web_search: create_web_search(&config.web_search)?,
            chat_history: Arc::new(store.clone()),
            documents: Arc::new(store.clone()),
            chunk_cache: Arc::new(store.clone()),
            metrics: metrics.clone(),
        };
        let pipeline = RagPipeline::new(services, config.pipeline_config());

        if warm {
            let report = pipeline.warm_start().await?;
            info!(documents = report.documents, chunks = report.chunks, "index restored");
        }

        Ok(Self {
            pipeline,
            store,
            metrics,
        })
    }

    /// Flush metrics and close the database.
    pub async fn shutdown(self) {
        self.metrics.close().await;
        self.store.pool().close().await;
    }
}
