//! Shared runtime state and the MCP server entry points.
//!
//! [`setup_shared_state`] wires the database, collaborators, and consolidator
//! together. [`serve`] runs the MCP server over the configured transport with
//! the background consolidation loop alongside it.

use anyhow::{Context, Result};
use chrono::Utc;
use rmcp::ServiceExt;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::LoreConfig;
use crate::consolidation::background::{BackgroundLoop, LoopSettings};
use crate::consolidation::{lock_db, ConsolidationReport, Consolidator};
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::episodes::transcripts::TranscriptDirSource;
use crate::error::LoreError;
use crate::knowledge::activation::{activate, ActivationOptions, ActivationResult};
use crate::knowledge::state::{reset_all, ResetSummary};
use crate::knowledge::stats::{knowledge_stats, StatsResponse};
use crate::llm;
use crate::tools::LoreTools;

/// Everything an entry point needs. Clones share the same store and gate.
#[derive(Clone)]
pub struct SharedState {
    pub db: Arc<Mutex<Connection>>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub consolidator: Arc<Consolidator>,
    pub config: Arc<LoreConfig>,
}

/// Open the DB, create the collaborators, and check the stored embedding model.
pub fn setup_shared_state(config: LoreConfig) -> Result<SharedState> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path, config.embedding.dimensions)?;
    tracing::info!(db = %db_path.display(), "database ready");

    match db::migrations::get_embedding_model(&conn)? {
        Some(stored) if stored != config.embedding.model => {
            tracing::warn!(
                stored = %stored,
                configured = %config.embedding.model,
                "embedding model changed; similarities against old vectors are unreliable until `lore reset`"
            );
        }
        Some(_) => {}
        None => db::migrations::set_embedding_model(&conn, &config.embedding.model)?,
    }

    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    let completion: Arc<dyn llm::CompletionProvider> =
        Arc::from(llm::create_provider(&config.llm)?);
    let source = Arc::new(TranscriptDirSource::new(config.resolved_transcripts_dir()));
    tracing::info!(
        embedding_model = %embedder.model_name(),
        llm = %config.llm.provider,
        transcripts = %config.resolved_transcripts_dir().display(),
        "collaborators ready"
    );

    Ok(SharedState::new(
        Arc::new(Mutex::new(conn)),
        source,
        completion,
        embedder,
        config,
    ))
}

impl SharedState {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        source: Arc<dyn crate::episodes::EpisodeSource>,
        completion: Arc<dyn llm::CompletionProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: LoreConfig,
    ) -> Self {
        let consolidator = Arc::new(Consolidator::new(
            Arc::clone(&db),
            source,
            completion,
            Arc::clone(&embedder),
            &config,
        ));
        Self {
            db,
            embedder,
            consolidator,
            config: Arc::new(config),
        }
    }

    /// Embed `query` and rank live knowledge against it.
    pub async fn activate(
        &self,
        query: &str,
        limit: Option<usize>,
        threshold: Option<f64>,
    ) -> Result<ActivationResult> {
        let query = query.trim();
        anyhow::ensure!(!query.is_empty(), "query must not be empty");

        let mut options = ActivationOptions::from(&self.config.activation);
        if let Some(limit) = limit {
            anyhow::ensure!(limit > 0, "limit must be greater than 0");
            options.limit = limit;
        }
        if let Some(threshold) = threshold {
            anyhow::ensure!(
                (-1.0..=1.0).contains(&threshold),
                "threshold must be between -1.0 and 1.0"
            );
            options.threshold = threshold;
        }

        let embedding = self.embedder.embed(query).await?;
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = lock_db(&db)?;
            activate(&conn, &embedding, options, Utc::now())
        })
        .await
        .context("activation task failed")?
    }

    pub async fn consolidate(&self) -> Result<ConsolidationReport> {
        self.consolidator.run().await
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let db = Arc::clone(&self.db);
        let db_path = self.config.resolved_db_path();
        tokio::task::spawn_blocking(move || {
            let conn = lock_db(&db)?;
            knowledge_stats(&conn, Some(&db_path))
        })
        .await
        .context("stats task failed")?
    }

    /// Clear all knowledge. Refused while a consolidation run is in flight.
    pub fn reset(&self) -> Result<ResetSummary> {
        let Some(_guard) = self.consolidator.gate().try_acquire() else {
            return Err(LoreError::RunInProgress.into());
        };
        let mut conn = lock_db(&self.db)?;
        let summary = reset_all(&mut conn)?;
        tracing::warn!(
            entries = summary.entries_removed,
            relations = summary.relations_removed,
            episodes = summary.episodes_removed,
            "knowledge store reset"
        );
        Ok(summary)
    }
}

/// Run the MCP server on the configured transport until the client leaves or ctrl-c.
pub async fn serve(config: LoreConfig) -> Result<()> {
    let state = setup_shared_state(config)?;
    let background = state.config.consolidation.enabled.then(|| {
        BackgroundLoop::spawn(
            Arc::clone(&state.consolidator),
            LoopSettings::from(&state.config.consolidation),
        )
    });
    let grace = Duration::from_secs(state.config.server.shutdown_grace_secs);

    let served = match state.config.server.transport.as_str() {
        "http" => serve_http(state.clone()).await,
        _ => serve_stdio(state.clone()).await,
    };

    if let Some(background) = background {
        if background.shutdown(grace).await {
            tracing::info!("background consolidation finished cleanly");
        }
    }
    drop(state);
    tracing::info!("knowledge store released");
    served
}

async fn serve_stdio(state: SharedState) -> Result<()> {
    tracing::info!("starting lore MCP server on stdio");

    let server = LoreTools::new(state).serve(rmcp::transport::stdio()).await?;
    tracing::info!("MCP server running, waiting for client");

    tokio::select! {
        quit = server.waiting() => {
            quit?;
            tracing::info!("MCP client disconnected");
        }
        _ = shutdown_signal() => {}
    }
    Ok(())
}

async fn serve_http(state: SharedState) -> Result<()> {
    let bind_addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    tracing::info!(addr = %bind_addr, "starting lore MCP server on streamable HTTP");

    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(LoreTools::new(state.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
