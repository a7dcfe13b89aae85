//! Financial Modeling Prep market data provider.
//!
//! Builds a `MarketSnapshot` from three endpoints, all issued through the
//! shared rate-limited FMP client:
//!
//! - `/api/v3/profile/{symbol}` — price, market cap, beta, employees (required)
//! - `/api/v3/income-statement/{symbol}?limit=1` — latest annual P&L
//! - `/api/v3/cash-flow-statement/{symbol}?limit=1` — latest cash flow
//!
//! Auth: API key via `apikey` query param.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{validate_symbol, MarketDataSource};
use crate::net::{send_json, CallError, RateLimitedClient};
use crate::types::{MarketSnapshot, PipelineError, Ticker};

pub const DEFAULT_BASE_URL: &str = "https://financialmodelingprep.com";

/// Provider field → snapshot field, per endpoint.
const PROFILE_FIELDS: &[(&str, &str)] = &[
    ("price", "price"),
    ("changes", "change"),
    ("mktCap", "market_cap"),
    ("beta", "beta"),
    ("volAvg", "average_volume"),
    ("lastDiv", "last_dividend"),
    ("fullTimeEmployees", "employees"),
];

const INCOME_FIELDS: &[(&str, &str)] = &[
    ("revenue", "revenue"),
    ("operatingExpenses", "operating_expenses"),
    ("ebitda", "ebitda"),
    ("grossProfitRatio", "gross_margin"),
    ("netIncomeRatio", "net_margin"),
    ("researchAndDevelopmentExpenses", "rd_expense"),
];

const CASH_FLOW_FIELDS: &[(&str, &str)] = &[
    ("capitalExpenditure", "capex"),
    ("freeCashFlow", "free_cash_flow"),
];

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Numbers pass through; numeric strings (FMP sends `fullTimeEmployees`
/// as a string) are parsed; everything else is `None`.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// FMP reports bad keys and quota problems as `{"Error Message": ...}`
/// with a 200 status.
fn provider_error(body: &Value) -> Option<String> {
    body.get("Error Message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Extract mapped fields from the first element of a statement array.
/// An empty array yields no fields.
fn statement_fields(body: &Value, mapping: &'static [(&'static str, &'static str)]) -> Result<Vec<(&'static str, Option<f64>)>, String> {
    let rows = body
        .as_array()
        .ok_or_else(|| "statement response is not an array".to_string())?;

    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };

    let obj = first
        .as_object()
        .ok_or_else(|| "statement entry is not an object".to_string())?;

    Ok(mapping
        .iter()
        .map(|(src, dst)| (*dst, obj.get(*src).and_then(number)))
        .collect())
}

/// Validate the profile response and extract its fields and company name.
fn profile_fields(body: &Value, symbol: &str) -> Result<(Vec<(&'static str, Option<f64>)>, Option<String>), String> {
    let first = body
        .as_array()
        .and_then(|rows| rows.first())
        .and_then(Value::as_object)
        .ok_or_else(|| "profile response is not a non-empty array of objects".to_string())?;

    let returned = first
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| "profile is missing required field `symbol`".to_string())?;

    if !returned.eq_ignore_ascii_case(symbol) {
        return Err(format!("profile symbol mismatch: asked for {symbol}, got {returned}"));
    }

    let fields = PROFILE_FIELDS
        .iter()
        .map(|(src, dst)| (*dst, first.get(*src).and_then(number)))
        .collect();

    let name = first
        .get("companyName")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok((fields, name))
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct FmpClient {
    http: Client,
    base_url: String,
    api_key: Secret<String>,
    client: Arc<RateLimitedClient>,
}

impl FmpClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Secret<String>,
        timeout: Duration,
        client: Arc<RateLimitedClient>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("market-explorer/0.1")
            .build()
            .context("Failed to build FMP HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// One GET through the rate-limited client; provider-level error
    /// payloads are treated as non-transient.
    async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, crate::net::ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        let http = &self.http;
        let key = self.api_key.expose_secret().as_str();

        self.client
            .call(move || async move {
                let body = send_json(
                    http.get(url)
                        .query(params)
                        .query(&[("apikey", key)]),
                )
                .await?;
                match provider_error(&body) {
                    Some(msg) => Err(CallError::NonTransient(format!("FMP error: {msg}"))),
                    None => Ok(body),
                }
            })
            .await
    }

    fn unavailable(&self, ticker: &Ticker, message: impl Into<String>) -> PipelineError {
        PipelineError::SourceUnavailable {
            data_source: self.name().to_string(),
            ticker: ticker.symbol.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl MarketDataSource for FmpClient {
    async fn snapshot(&self, ticker: &Ticker) -> Result<MarketSnapshot, PipelineError> {
        let symbol = ticker.symbol.trim().to_uppercase();
        validate_symbol(&symbol).map_err(|e| self.unavailable(ticker, e))?;

        let encoded = urlencoding::encode(&symbol).into_owned();

        let profile = self
            .get(&format!("/api/v3/profile/{encoded}"), &[])
            .await
            .map_err(|e| self.unavailable(ticker, e.to_string()))?;
        let (mut values, company_name) =
            profile_fields(&profile, &symbol).map_err(|e| self.unavailable(ticker, e))?;

        let income = self
            .get(&format!("/api/v3/income-statement/{encoded}"), &[("limit", "1")])
            .await
            .map_err(|e| self.unavailable(ticker, e.to_string()))?;
        values.extend(statement_fields(&income, INCOME_FIELDS).map_err(|e| self.unavailable(ticker, e))?);

        let cash_flow = self
            .get(&format!("/api/v3/cash-flow-statement/{encoded}"), &[("limit", "1")])
            .await
            .map_err(|e| self.unavailable(ticker, e.to_string()))?;
        values.extend(statement_fields(&cash_flow, CASH_FLOW_FIELDS).map_err(|e| self.unavailable(ticker, e))?);

        let snapshot = MarketSnapshot::new(symbol.clone(), Utc::now(), values)
            .with_company_name(company_name);

        debug!(
            ticker = %symbol,
            populated = snapshot.populated(),
            "FMP snapshot fetched"
        );

        Ok(snapshot)
    }

    fn name(&self) -> &str {
        "fmp"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
