//! OpenAI Chat Completions integration.
//!
//! Default provider. Requests JSON-object output so the synthesis schema
//! can be parsed without scraping prose.

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

use super::{LanguageModel, Prompt};
use crate::net::{send_json, ClientError, RateLimitedClient};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 800;

/// Approximate cost per 1K input tokens (gpt-4o-mini).
const INPUT_COST_PER_1K: f64 = 0.00015;
/// Approximate cost per 1K output tokens (gpt-4o-mini).
const OUTPUT_COST_PER_1K: f64 = 0.0006;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<WireMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    http: Client,
    url: String,
    api_key: Secret<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    client: Arc<RateLimitedClient>,
    /// Stored as cost * 1_000_000.
    total_cost: AtomicU64,
    total_tokens: AtomicU64,
}

impl OpenAiClient {
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
            .context("Failed to build OpenAI HTTP client")?;

        Ok(Self {
            http,
            url: OPENAI_API_URL.to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: 0.2,
            client,
            total_cost: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
        })
    }

    /// Point the client at a compatible endpoint (proxy, local server).
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

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    fn build_request<'a>(&'a self, prompt: &'a Prompt) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: &prompt.system,
        });
        for m in &prompt.messages {
            messages.push(WireMessage {
                role: match m.role {
                    super::Role::User => "user",
                    super::Role::Assistant => "assistant",
                },
                content: &m.content,
            });
        }

        ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        }
    }

    fn record_usage(&self, usage: &ChatUsage) {
        let cost = (usage.prompt_tokens as f64 / 1000.0) * INPUT_COST_PER_1K
            + (usage.completion_tokens as f64 / 1000.0) * OUTPUT_COST_PER_1K;
        self.total_cost
            .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);
        self.total_tokens.fetch_add(
            (usage.prompt_tokens + usage.completion_tokens) as u64,
            Ordering::Relaxed,
        );
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ClientError> {
        let request = self.build_request(prompt);
        let request = &request;
        let http = &self.http;
        let url = self.url.as_str();
        let auth = format!("Bearer {}", self.api_key.expose_secret());
        let auth = auth.as_str();

        debug!(model = %self.model, turns = prompt.messages.len(), "OpenAI completion");

        let body = self
            .client
            .call(move || async move {
                send_json(
                    http.post(url)
                        .header("Authorization", auth)
                        .json(request),
                )
                .await
            })
            .await?;

        let parsed: ChatResponse = serde_json::from_value(body).map_err(|e| ClientError::NonTransient {
            dependency: self.client.name().to_string(),
            message: format!("unexpected OpenAI response: {e}"),
        })?;

        if let Some(usage) = &parsed.usage {
            self.record_usage(usage);
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ClientError::NonTransient {
                dependency: self.client.name().to_string(),
                message: "OpenAI returned no content".to_string(),
            })
    }

    fn cumulative_cost(&self) -> Decimal {
        Decimal::from(self.total_cost.load(Ordering::Relaxed)) / Decimal::from(1_000_000u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
