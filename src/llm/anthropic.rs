//! Anthropic Claude integration.
//!
//! Implements `LanguageModel` on the Anthropic Messages API. The API has
//! no JSON response mode, so the system prompt alone asks for the object
//! and the synthesis engine extracts it from the reply.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ChatMessage, LanguageModel, Prompt};
use crate::net::{send_json, ClientError, RateLimitedClient};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Approximate cost per 1K input tokens (Sonnet).
const INPUT_COST_PER_1K: f64 = 0.003;
/// Approximate cost per 1K output tokens (Sonnet).
const OUTPUT_COST_PER_1K: f64 = 0.015;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AnthropicClient {
    http: Client,
    url: String,
    api_key: Secret<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    client: Arc<RateLimitedClient>,
    total_cost: AtomicU64, // stored as cost * 1_000_000
}

impl AnthropicClient {
    pub fn new(
        api_key: Secret<String>,
        model: Option<String>,
        max_tokens: Option<u32>,
        timeout: Duration,
        client: Arc<RateLimitedClient>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Anthropic HTTP client")?;

        Ok(Self {
            http,
            url: ANTHROPIC_API_URL.to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: 0.2,
            client,
            total_cost: AtomicU64::new(0),
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    fn build_request<'a>(&'a self, prompt: &'a Prompt) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: &prompt.system,
            messages: &prompt.messages,
        }
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ClientError> {
        let request = self.build_request(prompt);
        let request = &request;
        let http = &self.http;
        let url = self.url.as_str();
        let key = self.api_key.expose_secret().as_str();

        debug!(model = %self.model, turns = prompt.messages.len(), "Anthropic completion");

        let body = self
            .client
            .call(move || async move {
                send_json(
                    http.post(url)
                        .header("x-api-key", key)
                        .header("anthropic-version", ANTHROPIC_VERSION)
                        .json(request),
                )
                .await
            })
            .await?;

        let parsed: MessagesResponse = serde_json::from_value(body).map_err(|e| ClientError::NonTransient {
            dependency: self.client.name().to_string(),
            message: format!("unexpected Anthropic response: {e}"),
        })?;

        if let Some(usage) = &parsed.usage {
            let cost = (usage.input_tokens as f64 / 1000.0) * INPUT_COST_PER_1K
                + (usage.output_tokens as f64 / 1000.0) * OUTPUT_COST_PER_1K;
            self.total_cost
                .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);
        }

        let text = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(ClientError::NonTransient {
                dependency: self.client.name().to_string(),
                message: "Anthropic returned no text content".to_string(),
            });
        }

        Ok(text)
    }

    fn cumulative_cost(&self) -> Decimal {
        Decimal::from(self.total_cost.load(Ordering::Relaxed)) / Decimal::from(1_000_000u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
