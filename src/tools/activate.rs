//! MCP `activate_knowledge` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `activate_knowledge` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ActivateKnowledgeParams {
    /// Natural language description of what you need to know.
    #[schemars(description = "Natural language description of the knowledge you need")]
    pub query: String,

    /// Maximum number of entries to return. Defaults to the configured limit.
    #[schemars(description = "Maximum number of entries to return. Defaults to 8.")]
    pub limit: Option<usize>,

    /// Minimum raw cosine similarity for an entry to be considered.
    #[schemars(
        description = "Minimum raw similarity (-1.0 to 1.0) for an entry to be considered. Defaults to 0.30."
    )]
    pub threshold: Option<f64>,
}
