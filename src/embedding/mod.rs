//! Text-to-vector embedding.
//!
//! Provides the [`EmbeddingProvider`] trait and an OpenAI-compatible HTTP
//! implementation. The provider is created via [`create_provider`] from
//! configuration.

pub mod openai;

use anyhow::Result;
use async_trait::async_trait;

/// Embeds text into fixed-width vectors in a shared space.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts. The output has one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedding provider returned no vector"))
    }

    /// Width of every vector this provider produces.
    fn dimensions(&self) -> usize;

    /// Model identifier, recorded in `schema_meta`.
    fn model_name(&self) -> &str;
}

/// Create an embedding provider from config.
///
/// Only `"openai"` (any OpenAI-compatible `/embeddings` endpoint) is supported.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(openai::OpenAiEmbeddingProvider::from_config(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: openai"),
    }
}
