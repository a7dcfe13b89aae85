//! In-process stand-ins for the market data, search and model providers.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use market_explorer::data::{MarketDataSource, SearchContextSource};
use market_explorer::engine::{PipelineOrchestrator, RunSettings, SynthesisEngine};
use market_explorer::llm::{LanguageModel, Prompt};
use market_explorer::net::{ClientError, RateLimitedClient, RetryPolicy};
use market_explorer::storage::{MemorySheetStore, SheetSink};
use market_explorer::types::{MarketSnapshot, PipelineError, SearchResult, Ticker};

pub fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        jitter: 0.0,
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeMarket {
    prices: HashMap<String, f64>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    pub calls: AtomicUsize,
}

impl FakeMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, symbol: &str, price: f64) -> Self {
        self.prices.insert(symbol.to_string(), price);
        self
    }

    pub fn failing(mut self, symbol: &str) -> Self {
        self.failing.insert(symbol.to_string());
        self
    }

    pub fn delayed(mut self, symbol: &str, delay: Duration) -> Self {
        self.delays.insert(symbol.to_string(), delay);
        self
    }
}

#[async_trait]
impl MarketDataSource for FakeMarket {
    async fn snapshot(&self, ticker: &Ticker) -> Result<MarketSnapshot, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&ticker.symbol) {
            tokio::time::sleep(*delay).await;
        }

        let unavailable = |message: &str| PipelineError::SourceUnavailable {
            data_source: "fake-market".to_string(),
            ticker: ticker.symbol.clone(),
            message: message.to_string(),
        };

        if self.failing.contains(&ticker.symbol) {
            return Err(unavailable("still failing after 3 attempts: HTTP 503"));
        }
        let price = *self
            .prices
            .get(&ticker.symbol)
            .ok_or_else(|| unavailable("unknown symbol"))?;

        Ok(MarketSnapshot::new(
            ticker.symbol.clone(),
            Utc::now(),
            [("price", Some(price)), ("revenue", Some(1.2e9)), ("beta", Some(1.1))],
        )
        .with_company_name(ticker.name.clone()))
    }

    fn name(&self) -> &str {
        "fake-market"
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

pub fn url_for(symbol: &str, n: usize) -> String {
    format!("https://news.example/{}/{n}", symbol.to_lowercase())
}

#[derive(Default)]
pub struct FakeSearch {
    failing: HashSet<String>,
    pub calls: AtomicUsize,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, symbol: &str) -> Self {
        self.failing.insert(symbol.to_string());
        self
    }
}

#[async_trait]
impl SearchContextSource for FakeSearch {
    async fn search(&self, ticker: &Ticker) -> Result<Vec<SearchResult>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&ticker.symbol) {
            return Err(PipelineError::SourceUnavailable {
                data_source: "fake-search".to_string(),
                ticker: ticker.symbol.clone(),
                message: "HTTP 403 Forbidden: quota exceeded".to_string(),
            });
        }
        Ok((1..=2)
            .map(|n| SearchResult {
                title: format!("{} headline {n}", ticker.symbol),
                snippet: format!("{} snippet {n}", ticker.symbol),
                url: url_for(&ticker.symbol, n),
                query: format!("{} stock news", ticker.symbol),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "fake-search"
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// The symbol on the prompt's `TICKER:` line.
pub fn prompt_ticker(prompt: &Prompt) -> String {
    prompt.messages[0]
        .content
        .lines()
        .find_map(|l| l.strip_prefix("TICKER: "))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("")
        .to_string()
}

/// URLs offered in the prompt's search results.
pub fn prompt_urls(prompt: &Prompt) -> Vec<String> {
    prompt.messages[0]
        .content
        .lines()
        .filter_map(|l| l.trim().strip_prefix("URL: "))
        .map(str::to_string)
        .collect()
}

/// Replies with a valid analysis citing every offered URL plus one that
/// was never offered, except for tickers scripted to answer garbage.
#[derive(Default)]
pub struct ScriptedModel {
    garbage_for: HashSet<String>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn garbage_for(mut self, symbol: &str) -> Self {
        self.garbage_for.insert(symbol.to_string());
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ticker = prompt_ticker(prompt);
        if self.garbage_for.contains(&ticker) {
            return Ok("Sorry, I cannot help with that.".to_string());
        }

        let mut citations = prompt_urls(prompt);
        citations.push("https://invented.example/not-offered".to_string());
        Ok(json!({
            "summary": format!("{ticker} reported steady revenue."),
            "score": 6.46,
            "citations": citations,
            "insights": ["Revenue stable", "Beta above market"],
        })
        .to_string())
    }

    fn cumulative_cost(&self) -> Decimal {
        Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn settings(concurrency: usize, deadline: Option<Duration>) -> RunSettings {
    RunSettings {
        run_date: run_date(),
        concurrency,
        deadline,
    }
}

pub fn orchestrator(
    market: Arc<FakeMarket>,
    search: Arc<FakeSearch>,
    model: Arc<ScriptedModel>,
    settings: RunSettings,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(market, search, SynthesisEngine::new(model), settings)
}

pub fn sink(store: Arc<MemorySheetStore>) -> SheetSink {
    let client = Arc::new(RateLimitedClient::new("sheets", None, fast_policy()));
    SheetSink::new(store, "Analysis", client).with_run_log("RunLog")
}

/// Data rows of a tab as header → cell maps.
pub fn rows_by_header(rows: &[Vec<String>]) -> Vec<HashMap<String, String>> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    data.iter()
        .map(|row| {
            header
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), row.get(i).cloned().unwrap_or_default()))
                .collect()
        })
        .collect()
}

pub fn tickers(symbols: &[&str]) -> Vec<Ticker> {
    symbols.iter().map(|s| Ticker::new(*s)).collect()
}
