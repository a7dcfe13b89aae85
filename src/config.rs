//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults, so a file listing only tickers is valid.
//! Secrets (API keys, the service account) are referenced by env-var name
//! in the config and resolved once at startup into `Credentials`.

use anyhow::{Context, Result};
use secrecy::Secret;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::data::validate_symbol;
use crate::net::RetryPolicy;
use crate::types::{PipelineError, Ticker};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub run: RunConfig,
    pub tickers: TickersConfig,
    pub market_data: MarketDataConfig,
    pub search: SearchConfig,
    pub llm: LlmConfig,
    pub sheet: SheetConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Tickers processed at once. 1 = sequential.
    pub concurrency: usize,
    /// Wall-clock budget for the analysis phase; 0 disables it.
    pub deadline_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            deadline_secs: 3000,
        }
    }
}

impl RunConfig {
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TickersConfig {
    pub list: Vec<TickerEntry>,
    /// Newline-separated `SYMBOL[,Display Name]`, `#` starts a comment.
    pub file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TickerEntry {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: crate::data::fmp::DEFAULT_BASE_URL.to_string(),
            api_key_env: "FMP_KEY".to_string(),
            min_interval_ms: 250,
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub engine_id_env: String,
    /// Results kept per ticker after de-duplication.
    pub top_k: usize,
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: crate::data::search::DEFAULT_ENDPOINT.to_string(),
            api_key_env: "CSE_KEY".to_string(),
            engine_id_env: "CSE_ID".to_string(),
            top_k: 5,
            min_interval_ms: 1000,
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Anthropic,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Provider default when unset.
    pub model: Option<String>,
    pub api_key_env: String,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    /// Override the provider endpoint (proxies, local servers).
    pub url: Option<String>,
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            model: None,
            api_key_env: "OPENAI_KEY".to_string(),
            max_tokens: None,
            temperature: 0.2,
            url: None,
            min_interval_ms: 500,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SheetConfig {
    pub spreadsheet_id_env: String,
    pub service_account_env: String,
    pub tab: String,
    /// Empty string disables the run log.
    pub run_log_tab: String,
    pub api_base: String,
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id_env: "GSHEET_ID".to_string(),
            service_account_env: "GOOGLE_SERVICE_JSON".to_string(),
            tab: "Analysis".to_string(),
            run_log_tab: "RunLog".to_string(),
            api_base: crate::storage::sheets::DEFAULT_API_BASE.to_string(),
            min_interval_ms: 1000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

/// Milliseconds from config to a rate-limit period; 0 disables limiting.
pub fn min_interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn config_error(message: impl Into<String>) -> PipelineError {
    PipelineError::ConfigurationFailed(message.into())
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.run.concurrency == 0 {
            return Err(config_error("run.concurrency must be at least 1"));
        }
        if self.search.top_k == 0 {
            return Err(config_error("search.top_k must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_error("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(config_error("retry.jitter must be within [0, 1]"));
        }
        if self.sheet.tab.trim().is_empty() {
            return Err(config_error("sheet.tab must not be empty"));
        }
        Ok(())
    }

    /// The configured ticker list: inline entries first, then the ticker
    /// file. Symbols are trimmed and upper-cased.
    pub fn resolve_tickers(&self) -> Result<Vec<Ticker>, PipelineError> {
        let mut tickers: Vec<Ticker> = self
            .tickers
            .list
            .iter()
            .map(|e| Ticker {
                symbol: e.symbol.trim().to_uppercase(),
                name: e.name.clone().filter(|n| !n.trim().is_empty()),
            })
            .collect();

        if let Some(path) = &self.tickers.file {
            let text = fs::read_to_string(Path::new(path))
                .map_err(|e| config_error(format!("cannot read ticker file {path}: {e}")))?;
            tickers.extend(parse_ticker_lines(&text));
        }

        check_tickers(&tickers)?;
        Ok(tickers)
    }
}

/// Parse `SYMBOL[,Display Name]` lines; blank lines and `#` comments are
/// skipped.
pub fn parse_ticker_lines(text: &str) -> Vec<Ticker> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(',') {
            Some((symbol, name)) if !name.trim().is_empty() => {
                Ticker::with_name(symbol.trim().to_uppercase(), name.trim())
            }
            Some((symbol, _)) => Ticker::new(symbol.trim().to_uppercase()),
            None => Ticker::new(line.to_uppercase()),
        })
        .collect()
}

/// Non-empty, valid, and unique (case-insensitive).
pub fn check_tickers(tickers: &[Ticker]) -> Result<(), PipelineError> {
    if tickers.is_empty() {
        return Err(config_error("no tickers configured"));
    }
    let mut seen = HashSet::new();
    for t in tickers {
        validate_symbol(&t.symbol).map_err(|e| config_error(e))?;
        if !seen.insert(t.symbol.to_uppercase()) {
            return Err(config_error(format!("ticker {} is listed twice", t.symbol)));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Spreadsheet access, only needed when writing to Google Sheets.
#[derive(Debug)]
pub struct SheetCredentials {
    pub spreadsheet_id: String,
    pub service_account_json: Secret<String>,
}

/// Secrets resolved from the environment at startup.
#[derive(Debug)]
pub struct Credentials {
    pub fmp_key: Secret<String>,
    pub cse_key: Secret<String>,
    pub cse_id: String,
    pub llm_key: Secret<String>,
    pub sheet: Option<SheetCredentials>,
}

impl Credentials {
    pub fn from_env(config: &AppConfig, require_sheet: bool) -> Result<Self, PipelineError> {
        Self::from_lookup(config, require_sheet, |name| std::env::var(name).ok())
    }

    /// Resolve every secret through `lookup`, reporting all missing
    /// variables at once.
    pub fn from_lookup(
        config: &AppConfig,
        require_sheet: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PipelineError> {
        let mut missing = Vec::new();
        let mut get = |name: &str| -> String {
            match lookup(name).filter(|v| !v.trim().is_empty()) {
                Some(v) => v,
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        };

        let fmp_key = get(&config.market_data.api_key_env);
        let cse_key = get(&config.search.api_key_env);
        let cse_id = get(&config.search.engine_id_env);
        let llm_key = get(&config.llm.api_key_env);
        let sheet = require_sheet.then(|| SheetCredentials {
            spreadsheet_id: get(&config.sheet.spreadsheet_id_env),
            service_account_json: Secret::new(get(&config.sheet.service_account_env)),
        });

        if !missing.is_empty() {
            return Err(config_error(format!(
                "missing environment variables: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            fmp_key: Secret::new(fmp_key),
            cse_key: Secret::new(cse_key),
            cse_id,
            llm_key: Secret::new(llm_key),
            sheet,
        })
    }
}
