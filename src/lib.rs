//! Self-curating knowledge from conversation transcripts, served over MCP.
//!
//! lore reads past conversations, extracts durable knowledge (facts,
//! decisions, patterns, procedures, principles), and keeps that knowledge
//! tidy on its own:
//!
//! | Stage | What happens |
//! |-------|--------------|
//! | **Segment** | New transcript records are cut into episodes; a cursor and an episode log make runs resumable |
//! | **Extract** | A text-generation collaborator proposes candidate entries per chunk of episodes |
//! | **Reconcile** | Near-duplicates (cosine ≥ 0.82) are kept, updated, or replaced instead of inserted again |
//! | **Contradiction scan** | Related entries are checked for conflicts and superseded, merged, or flagged |
//! | **Decay** | Strength follows a forgetting curve; faded entries are archived, then tombstoned |
//! | **Activate** | Queries rank live entries by similarity × strength and reinforce what they return |
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec) for vectors
//! - **Collaborators**: OpenAI-compatible embeddings; Anthropic or OpenAI-compatible completions
//! - **Transport**: MCP over stdio (primary) or streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, and migrations
//! - [`episodes`]: transcript reading and episode segmentation
//! - [`knowledge`]: the knowledge store, decay, activation, and statistics
//! - [`consolidation`]: the extract/reconcile/contradiction pipeline and its scheduler
//! - [`embedding`] and [`llm`]: HTTP clients for the external collaborators

pub mod cli;
pub mod config;
pub mod consolidation;
pub mod db;
pub mod embedding;
pub mod episodes;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod retry;
pub mod server;
pub mod tools;
