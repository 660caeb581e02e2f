//! Parameter definitions for the parameterless tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `knowledge_stats` MCP tool.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct KnowledgeStatsParams {}

/// Parameters for the `consolidate_knowledge` MCP tool.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConsolidateKnowledgeParams {}
