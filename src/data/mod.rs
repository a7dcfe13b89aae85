//! Per-ticker data sources.
//!
//! Defines the `MarketDataSource` and `SearchContextSource` traits the
//! orchestrator drives, plus the provider-independent rules they share:
//! symbol validation, query construction and result de-duplication.

pub mod fmp;
pub mod search;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::types::{MarketSnapshot, PipelineError, SearchResult, Ticker};

/// Longest symbol accepted by the providers.
const MAX_SYMBOL_LEN: usize = 10;

/// Source of quantitative market data.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch a snapshot for one ticker.
    ///
    /// Any failure is reported as `PipelineError::SourceUnavailable` and
    /// concerns this ticker only.
    async fn snapshot(&self, ticker: &Ticker) -> Result<MarketSnapshot, PipelineError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Source of web-search context.
#[async_trait]
pub trait SearchContextSource: Send + Sync {
    /// Up to K results in provider relevance order, de-duplicated by URL.
    async fn search(&self, ticker: &Ticker) -> Result<Vec<SearchResult>, PipelineError>;

    fn name(&self) -> &str;
}

/// Check that a symbol can be sent to a provider as-is.
pub fn validate_symbol(symbol: &str) -> Result<(), String> {
    if symbol.is_empty() {
        return Err("ticker symbol is empty".to_string());
    }
    if symbol.len() > MAX_SYMBOL_LEN {
        return Err(format!("ticker symbol `{symbol}` is longer than {MAX_SYMBOL_LEN} characters"));
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(format!("ticker symbol `{symbol}` contains invalid characters"));
    }
    if !symbol.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err(format!("ticker symbol `{symbol}` has no letters"));
    }
    Ok(())
}

/// Search queries for a ticker, most specific first.
pub fn search_queries(ticker: &Ticker) -> Vec<String> {
    let mut queries = vec![format!("{} stock news", ticker.symbol)];
    if let Some(name) = ticker.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        queries.push(format!("{name} financial outlook"));
    }
    queries
}

/// Keep the first occurrence of each URL, then cut to `k`.
pub fn dedupe_and_truncate(results: Vec<SearchResult>, k: usize) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|r| seen.insert(r.url.trim().to_string()))
        .take(k)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
