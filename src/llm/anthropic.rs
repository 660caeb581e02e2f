//! Anthropic Messages API client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ClientSettings, CompletionProvider};
use crate::retry::send_with_retry;

const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicClient {
    client: reqwest::Client,
    settings: ClientSettings,
}

impl AnthropicClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        Ok(Self {
            client: settings.http_client()?,
            settings,
        })
    }
}

#[async_trait]
impl CompletionProvider for AnthropicClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/messages", self.settings.base_url);
        let body = MessageRequest {
            model: &self.settings.model,
            max_tokens: self.settings.max_tokens,
            system,
            messages: [ApiMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = send_with_retry("completion", &self.settings.retry, || {
            let request = self
                .client
                .post(&url)
                .header("anthropic-version", API_VERSION)
                .json(&body);
            match &self.settings.api_key {
                Some(key) => request.header("x-api-key", key),
                None => request,
            }
        })
        .await?;

        let parsed: MessageResponse = response
            .json()
            .await
            .context("failed to parse Anthropic response")?;
        Ok(parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}
