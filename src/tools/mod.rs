pub mod activate;
pub mod stats;

use activate::ActivateKnowledgeParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use stats::{ConsolidateKnowledgeParams, KnowledgeStatsParams};

use crate::error::LoreError;
use crate::server::SharedState;

/// The lore MCP tool handler. Holds the shared state and exposes the tools via
/// the `#[tool_router]` macro.
#[derive(Clone)]
pub struct LoreTools {
    tool_router: ToolRouter<Self>,
    state: SharedState,
}

#[tool_router]
impl LoreTools {
    pub fn new(state: SharedState) -> Self {
        Self {
            tool_router: Self::tool_router(),
            state,
        }
    }

    /// Retrieve curated knowledge relevant to a query.
    #[tool(description = "Retrieve curated knowledge relevant to a query. Results are ranked by similarity weighted by strength and carry staleness and contradiction notes.")]
    async fn activate_knowledge(
        &self,
        Parameters(params): Parameters<ActivateKnowledgeParams>,
    ) -> Result<String, String> {
        tracing::info!(
            query_len = params.query.len(),
            limit = ?params.limit,
            threshold = ?params.threshold,
            "activate_knowledge called"
        );

        let result = self
            .state
            .activate(&params.query, params.limit, params.threshold)
            .await
            .map_err(|e| format!("activation failed: {e:#}"))?;

        tracing::info!(
            returned = result.entries.len(),
            live = result.total_live_count,
            "knowledge activated"
        );
        serde_json::to_string(&result).map_err(|e| format!("serialization failed: {e}"))
    }

    /// Run one consolidation pass now.
    #[tool(description = "Consolidate new conversation transcripts into the knowledge base now. Reports a conflict if a run is already in progress.")]
    async fn consolidate_knowledge(
        &self,
        Parameters(_params): Parameters<ConsolidateKnowledgeParams>,
    ) -> Result<String, String> {
        tracing::info!("consolidate_knowledge called");
        match self.state.consolidate().await {
            Ok(report) => {
                serde_json::to_string(&report).map_err(|e| format!("serialization failed: {e}"))
            }
            Err(e) if matches!(e.downcast_ref::<LoreError>(), Some(LoreError::RunInProgress)) => {
                Ok(serde_json::json!({
                    "status": "conflict",
                    "message": e.to_string(),
                })
                .to_string())
            }
            Err(e) => {
                tracing::error!(error = %e, "consolidation failed");
                Err(format!("consolidation failed: {e:#}"))
            }
        }
    }

    /// Get statistics about the knowledge store.
    #[tool(description = "Get knowledge store statistics: counts by status, kind, and relation, plus consolidation progress.")]
    async fn knowledge_stats(
        &self,
        Parameters(_params): Parameters<KnowledgeStatsParams>,
    ) -> Result<String, String> {
        let stats = self
            .state
            .stats()
            .await
            .map_err(|e| format!("stats failed: {e:#}"))?;
        serde_json::to_string(&stats).map_err(|e| format!("serialization failed: {e}"))
    }
}

#[tool_handler]
impl ServerHandler for LoreTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "lore is a self-curating knowledge base built from past conversations. \
                 Use activate_knowledge to recall what is known about a topic."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
