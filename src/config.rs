use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::LoreError;
use crate::knowledge::types::KnowledgeType;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoreConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub consolidation: ConsolidationConfig,
    pub decay: DecayConfig,
    pub activation: ActivationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// How long shutdown waits for an in-flight consolidation run.
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory tree of JSONL transcripts. Read-only.
    pub transcripts_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub dimensions: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Run the background loop when serving.
    pub enabled: bool,
    pub interval_minutes: u64,
    pub session_batch_size: usize,
    pub episodes_per_chunk: usize,
    pub max_context_entries: usize,
    pub window_token_budget: usize,
    pub min_session_records: usize,
    pub reconcile_threshold: f64,
    pub contradiction_min_similarity: f64,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DecayConfig {
    pub fact_half_life_days: f64,
    pub principle_half_life_days: f64,
    pub pattern_half_life_days: f64,
    pub decision_half_life_days: f64,
    pub procedure_half_life_days: f64,
    pub archive_threshold: f64,
    pub tombstone_after_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ActivationConfig {
    pub default_limit: usize,
    pub default_threshold: f64,
    /// Returned entries below this strength are flagged `may_be_stale`.
    pub stale_strength: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            host: "127.0.0.1".into(),
            port: 8765,
            log_level: "info".into(),
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_lore_dir()
            .join("knowledge.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            transcripts_dir: "~/.claude/projects".into(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            dimensions: 1536,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: "claude-haiku-4-5".into(),
            base_url: "https://api.anthropic.com/v1".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            max_tokens: 4096,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 360,
            session_batch_size: 20,
            episodes_per_chunk: 4,
            max_context_entries: 30,
            window_token_budget: 6000,
            min_session_records: 2,
            reconcile_threshold: 0.82,
            contradiction_min_similarity: 0.40,
            max_consecutive_failures: 3,
        }
    }
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            fact_half_life_days: 30.0,
            principle_half_life_days: 180.0,
            pattern_half_life_days: 90.0,
            decision_half_life_days: 60.0,
            procedure_half_life_days: 120.0,
            archive_threshold: 0.15,
            tombstone_after_days: 180,
        }
    }
}

impl DecayConfig {
    /// Base half-life in days for a knowledge kind.
    pub fn half_life_days(&self, kind: KnowledgeType) -> f64 {
        match kind {
            KnowledgeType::Fact => self.fact_half_life_days,
            KnowledgeType::Principle => self.principle_half_life_days,
            KnowledgeType::Pattern => self.pattern_half_life_days,
            KnowledgeType::Decision => self.decision_half_life_days,
            KnowledgeType::Procedure => self.procedure_half_life_days,
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            default_limit: 8,
            default_threshold: 0.30,
            stale_strength: 0.30,
        }
    }
}

/// Returns `~/.lore/`
pub fn default_lore_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lore")
}

/// Returns the default config file path: `~/.lore/config.toml`
pub fn default_config_path() -> PathBuf {
    default_lore_dir().join("config.toml")
}

impl LoreConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            LoreConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (LORE_DB, LORE_LOG_LEVEL, LORE_TRANSCRIPTS).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LORE_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("LORE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("LORE_TRANSCRIPTS") {
            self.source.transcripts_dir = val;
        }
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<(), LoreError> {
        let mut problems = Vec::new();

        if !matches!(self.server.transport.as_str(), "stdio" | "http") {
            problems.push(format!(
                "server.transport must be 'stdio' or 'http', got '{}'",
                self.server.transport
            ));
        }
        if !matches!(self.llm.provider.as_str(), "anthropic" | "openai") {
            problems.push(format!(
                "llm.provider must be 'anthropic' or 'openai', got '{}'",
                self.llm.provider
            ));
        }
        if self.embedding.provider != "openai" {
            problems.push(format!(
                "embedding.provider must be 'openai', got '{}'",
                self.embedding.provider
            ));
        }
        if self.embedding.dimensions == 0 {
            problems.push("embedding.dimensions must be greater than 0".into());
        }
        if self.llm.max_tokens == 0 {
            problems.push("llm.max_tokens must be greater than 0".into());
        }

        let c = &self.consolidation;
        for (name, value) in [
            ("consolidation.session_batch_size", c.session_batch_size),
            ("consolidation.episodes_per_chunk", c.episodes_per_chunk),
            ("consolidation.max_context_entries", c.max_context_entries),
            ("consolidation.window_token_budget", c.window_token_budget),
            ("consolidation.min_session_records", c.min_session_records),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than 0"));
            }
        }
        if c.interval_minutes == 0 {
            problems.push("consolidation.interval_minutes must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&c.reconcile_threshold) {
            problems.push("consolidation.reconcile_threshold must be within [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&c.contradiction_min_similarity) {
            problems.push(
                "consolidation.contradiction_min_similarity must be within [0, 1]".into(),
            );
        }
        if c.contradiction_min_similarity >= c.reconcile_threshold {
            problems.push(
                "consolidation.contradiction_min_similarity must be below reconcile_threshold"
                    .into(),
            );
        }

        let d = &self.decay;
        for kind in KnowledgeType::ALL {
            if d.half_life_days(kind) <= 0.0 {
                problems.push(format!("decay.{kind}_half_life_days must be positive"));
            }
        }
        if !(0.0..1.0).contains(&d.archive_threshold) {
            problems.push("decay.archive_threshold must be within [0, 1)".into());
        }
        if d.tombstone_after_days < 0 {
            problems.push("decay.tombstone_after_days must not be negative".into());
        }

        if self.activation.default_limit == 0 {
            problems.push("activation.default_limit must be greater than 0".into());
        }
        if !(-1.0..=1.0).contains(&self.activation.default_threshold) {
            problems.push("activation.default_threshold must be within [-1, 1]".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(LoreError::InvalidConfig(problems))
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the transcript directory, expanding `~` if needed.
    pub fn resolved_transcripts_dir(&self) -> PathBuf {
        expand_tilde(&self.source.transcripts_dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
