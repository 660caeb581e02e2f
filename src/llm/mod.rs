//! Text-completion collaborator.
//!
//! Extraction, reconciliation, and contradiction resolution all go through
//! [`CompletionProvider::complete`]. Two HTTP implementations exist: the
//! Anthropic Messages API and OpenAI-compatible chat completions.

pub mod anthropic;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::retry::RetryPolicy;

/// A black-box text generator.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run one completion and return the assistant text.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Settings shared by both HTTP clients.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(env = %config.api_key_env, "completion API key not set");
        }
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryPolicy::with_max_retries(config.max_retries),
        }
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        use anyhow::Context;
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client")
    }
}

/// Create a completion provider from config.
pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn CompletionProvider>> {
    let settings = ClientSettings::from_config(config);
    match config.provider.as_str() {
        "anthropic" => Ok(Box::new(anthropic::AnthropicClient::new(settings)?)),
        "openai" => Ok(Box::new(openai::OpenAiChatClient::new(settings)?)),
        other => anyhow::bail!("unknown llm provider: {other}. Supported: anthropic, openai"),
    }
}
