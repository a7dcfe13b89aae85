//! Shared types for the Market Explorer pipeline.
//!
//! These types form the data model passed between the data sources,
//! the synthesis engine, the orchestrator and the sheet sink. They carry
//! no I/O of their own so every module can depend on them freely.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// A financial instrument to analyse, as listed in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    /// Human-readable company name, used to widen search queries.
    #[serde(default)]
    pub name: Option<String>,
}

impl Ticker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
        }
    }

    pub fn with_name(symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: Some(name.into()),
        }
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.symbol, name),
            None => write!(f, "{}", self.symbol),
        }
    }
}

// ---------------------------------------------------------------------------
// Market snapshot
// ---------------------------------------------------------------------------

/// Every snapshot carries exactly these fields, in this order.
/// Values the provider omits are recorded as `None`.
pub const SNAPSHOT_FIELDS: &[&str] = &[
    "price",
    "change",
    "market_cap",
    "beta",
    "average_volume",
    "last_dividend",
    "employees",
    "revenue",
    "operating_expenses",
    "ebitda",
    "gross_margin",
    "net_margin",
    "rd_expense",
    "capex",
    "free_cash_flow",
];

/// Point-in-time quantitative fields for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub ticker: String,
    pub company_name: Option<String>,
    pub as_of: DateTime<Utc>,
    fields: BTreeMap<String, Option<f64>>,
}

impl MarketSnapshot {
    /// Build a snapshot with the fixed field set. Unknown names in `values`
    /// are ignored; known names not supplied become `None`.
    pub fn new<'a>(
        ticker: impl Into<String>,
        as_of: DateTime<Utc>,
        values: impl IntoIterator<Item = (&'a str, Option<f64>)>,
    ) -> Self {
        let mut fields: BTreeMap<String, Option<f64>> = SNAPSHOT_FIELDS
            .iter()
            .map(|name| (name.to_string(), None))
            .collect();

        for (name, value) in values {
            if let Some(slot) = fields.get_mut(name) {
                *slot = value.filter(|v| v.is_finite());
            }
        }

        Self {
            ticker: ticker.into(),
            company_name: None,
            as_of,
            fields,
        }
    }

    pub fn with_company_name(mut self, name: Option<String>) -> Self {
        self.company_name = name.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied().flatten()
    }

    /// Fields in `SNAPSHOT_FIELDS` order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, Option<f64>)> + '_ {
        SNAPSHOT_FIELDS
            .iter()
            .map(move |name| (*name, self.get(name)))
    }

    /// Number of fields with a value.
    pub fn populated(&self) -> usize {
        self.fields.values().filter(|v| v.is_some()).count()
    }
}

// ---------------------------------------------------------------------------
// Search results
// ---------------------------------------------------------------------------

/// One web-search hit used as context for synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub url: String,
    /// The provider query that produced this hit.
    pub query: String,
}

// ---------------------------------------------------------------------------
// Analysis record
// ---------------------------------------------------------------------------

/// Whether a record was produced from complete inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Partial,
    Failed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Ok => write!(f, "ok"),
            RecordStatus::Partial => write!(f, "partial"),
            RecordStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ok" => Ok(RecordStatus::Ok),
            "partial" => Ok(RecordStatus::Partial),
            "failed" => Ok(RecordStatus::Failed),
            other => anyhow::bail!("unknown record status: {other}"),
        }
    }
}

/// The unit of output: one analysed ticker for one run date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub ticker: String,
    pub run_date: NaiveDate,
    pub summary: Option<String>,
    pub score: Option<f64>,
    pub citations: Vec<String>,
    pub insights: Vec<String>,
    pub status: RecordStatus,
    /// Why the record is `partial` or `failed`.
    pub reason: Option<String>,
}

impl AnalysisRecord {
    /// A record for a ticker that produced no analysis.
    pub fn failed(ticker: impl Into<String>, run_date: NaiveDate, reason: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            run_date,
            summary: None,
            score: None,
            citations: Vec::new(),
            insights: Vec::new(),
            status: RecordStatus::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.ticker, self.run_date)
    }

    /// Required fields are present for `ok` records; degraded records
    /// still carry their key and a reason.
    pub fn is_well_formed(&self) -> bool {
        if self.ticker.trim().is_empty() {
            return false;
        }
        match self.status {
            RecordStatus::Ok => {
                self.summary.as_deref().is_some_and(|s| !s.trim().is_empty())
                    && self.score.is_some_and(f64::is_finite)
            }
            RecordStatus::Partial | RecordStatus::Failed => {
                self.reason.as_deref().is_some_and(|r| !r.trim().is_empty())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence projection
// ---------------------------------------------------------------------------

/// (ticker, run date): the identity of a persisted row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub ticker: String,
    pub run_date: NaiveDate,
}

impl NaturalKey {
    /// Tickers compare case-insensitively and ignore surrounding whitespace.
    pub fn new(ticker: &str, run_date: NaiveDate) -> Self {
        Self {
            ticker: ticker.trim().to_uppercase(),
            run_date,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticker, self.run_date)
    }
}

/// Columns owned by the sheet sink, in default header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Ticker,
    RunDate,
    Summary,
    Score,
    Citations,
    Status,
    Reason,
    Insights,
}

impl Column {
    pub const ALL: &'static [Column] = &[
        Column::Ticker,
        Column::RunDate,
        Column::Summary,
        Column::Score,
        Column::Citations,
        Column::Status,
        Column::Reason,
        Column::Insights,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            Column::Ticker => "ticker",
            Column::RunDate => "run_date",
            Column::Summary => "summary",
            Column::Score => "score",
            Column::Citations => "citations",
            Column::Status => "status",
            Column::Reason => "reason",
            Column::Insights => "insights",
        }
    }
}

/// Date format used in the `run_date` column.
pub const RUN_DATE_FORMAT: &str = "%Y-%m-%d";

/// One cell value as written to the sheet. Numbers are sent as numbers
/// so the sheet can sort and chart them.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(s) => f.write_str(s),
            CellValue::Number(n) => write!(f, "{n}"),
        }
    }
}

impl PartialEq<str> for CellValue {
    fn eq(&self, other: &str) -> bool {
        match self {
            CellValue::Text(s) => s == other,
            CellValue::Number(_) => self.to_string() == other,
        }
    }
}

/// An analysis record as it is written to the sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub key: NaturalKey,
    cells: Vec<(Column, CellValue)>,
}

impl SheetRow {
    pub fn from_record(record: &AnalysisRecord, run_date: NaiveDate) -> Self {
        let score = match record.score {
            Some(s) => CellValue::Number((s * 10.0).round() / 10.0),
            None => CellValue::text(""),
        };
        let cells = vec![
            (Column::Ticker, CellValue::text(record.ticker.trim().to_uppercase())),
            (Column::RunDate, CellValue::text(run_date.format(RUN_DATE_FORMAT).to_string())),
            (Column::Summary, CellValue::text(record.summary.clone().unwrap_or_default())),
            (Column::Score, score),
            (Column::Citations, CellValue::text(record.citations.join("\n"))),
            (Column::Status, CellValue::text(record.status.to_string())),
            (Column::Reason, CellValue::text(record.reason.clone().unwrap_or_default())),
            (Column::Insights, CellValue::text(record.insights.join("\n"))),
        ];
        Self {
            key: NaturalKey::new(&record.ticker, run_date),
            cells,
        }
    }

    pub fn cell(&self, column: Column) -> &CellValue {
        const EMPTY: &CellValue = &CellValue::Text(String::new());
        self.cells
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v)
            .unwrap_or(EMPTY)
    }

    pub fn cells(&self) -> &[(Column, CellValue)] {
        &self.cells
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Error taxonomy of the pipeline.
///
/// Only `PersistenceFailed` and `ConfigurationFailed` ever reach the
/// process boundary; the rest are folded into record statuses.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Transient failure ({dependency}): {message}")]
    Transient { dependency: String, message: String },

    #[error("Non-transient failure ({dependency}): {message}")]
    NonTransient { dependency: String, message: String },

    #[error("Source unavailable ({data_source}) for {ticker}: {message}")]
    SourceUnavailable {
        data_source: String,
        ticker: String,
        message: String,
    },

    #[error("Synthesis failed for {ticker}: {message}")]
    SynthesisFailed { ticker: String, message: String },

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Configuration failed: {0}")]
    ConfigurationFailed(String),
}

impl PipelineError {
    /// Process exit code for an error that reached the top level.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::ConfigurationFailed(_) => 2,
            _ => 1,
        }
    }

    /// Whether this error must abort the run instead of degrading a ticker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::PersistenceFailed(_) | PipelineError::ConfigurationFailed(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
