//! Google Programmable Search (Custom Search JSON API) context provider.
//!
//! API: `https://customsearch.googleapis.com/customsearch/v1`
//! Auth: API key via `key`, search engine id via `cx`. Free tier: 100 req/day.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{dedupe_and_truncate, search_queries, SearchContextSource};
use crate::net::{send_json, CallError, ClientError, RateLimitedClient};
use crate::types::{PipelineError, SearchResult, Ticker};

pub const DEFAULT_ENDPOINT: &str = "https://customsearch.googleapis.com/customsearch/v1";

/// The API returns at most 10 items per request.
const MAX_RESULTS_PER_QUERY: usize = 10;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    /// Absent when the query has no hits.
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

fn normalise_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn into_results(response: SearchResponse, query: &str) -> Vec<SearchResult> {
    response
        .items
        .into_iter()
        .filter_map(|item| {
            let url = item.link?.trim().to_string();
            if url.is_empty() {
                return None;
            }
            Some(SearchResult {
                title: normalise_whitespace(item.title.as_deref().unwrap_or("")),
                snippet: normalise_whitespace(item.snippet.as_deref().unwrap_or("")),
                url,
                query: query.to_string(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct CustomSearchClient {
    http: Client,
    endpoint: String,
    api_key: Secret<String>,
    engine_id: String,
    top_k: usize,
    client: Arc<RateLimitedClient>,
}

impl CustomSearchClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Secret<String>,
        engine_id: impl Into<String>,
        top_k: usize,
        timeout: Duration,
        client: Arc<RateLimitedClient>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("market-explorer/0.1")
            .build()
            .context("Failed to build search HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
            engine_id: engine_id.into(),
            top_k: top_k.max(1),
            client,
        })
    }

    async fn query(&self, query: &str) -> Result<Vec<SearchResult>, ClientError> {
        let http = &self.http;
        let endpoint = self.endpoint.as_str();
        let key = self.api_key.expose_secret().as_str();
        let cx = self.engine_id.as_str();
        let num = self.top_k.min(MAX_RESULTS_PER_QUERY).to_string();
        let num = num.as_str();

        self.client
            .call(move || async move {
                let body = send_json(http.get(endpoint).query(&[
                    ("key", key),
                    ("cx", cx),
                    ("q", query),
                    ("num", num),
                ]))
                .await?;
                let parsed: SearchResponse = serde_json::from_value(body)
                    .map_err(|e| CallError::NonTransient(format!("unexpected search response: {e}")))?;
                Ok::<_, CallError>(into_results(parsed, query))
            })
            .await
    }
}

#[async_trait]
impl SearchContextSource for CustomSearchClient {
    async fn search(&self, ticker: &Ticker) -> Result<Vec<SearchResult>, PipelineError> {
        let mut collected = Vec::new();

        for query in search_queries(ticker) {
            let hits = self.query(&query).await.map_err(|e| PipelineError::SourceUnavailable {
                data_source: self.name().to_string(),
                ticker: ticker.symbol.clone(),
                message: e.to_string(),
            })?;
            debug!(ticker = %ticker.symbol, query = %query, hits = hits.len(), "Search query complete");
            collected.extend(hits);
        }

        Ok(dedupe_and_truncate(collected, self.top_k))
    }

    fn name(&self) -> &str {
        "google-cse"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
