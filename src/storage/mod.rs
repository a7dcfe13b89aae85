//! Persistence layer.
//!
//! `SheetSink` upserts analysis records into a spreadsheet tab keyed by
//! (ticker, run date). The spreadsheet itself sits behind `SheetStore`:
//! Google Sheets in production, an in-memory table for dry runs and tests.
//! Every store call goes through the sink's rate-limited client.

pub mod memory;
pub mod sheets;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::net::{CallError, RateLimitedClient};
use crate::types::{AnalysisRecord, CellValue, Column, NaturalKey, PipelineError, SheetRow, RUN_DATE_FORMAT};

pub use memory::MemorySheetStore;
pub use sheets::GoogleSheetsStore;

/// Header of the run-log tab.
pub const RUN_LOG_HEADER: &[&str] = &[
    "timestamp",
    "run_date",
    "tickers",
    "ok",
    "partial",
    "failed",
    "elapsed_seconds",
    "outcome",
];

// ---------------------------------------------------------------------------
// Store abstraction
// ---------------------------------------------------------------------------

/// Cells to set in one row, as `(column index, value)` sorted by column.
/// Row 0 is the header. Cells not listed are left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub row_index: usize,
    pub cells: Vec<(usize, CellValue)>,
}

impl RowUpdate {
    /// Group the cells into runs of adjacent columns, each returned as its
    /// first column index and values.
    pub fn runs(&self) -> Vec<(usize, Vec<&CellValue>)> {
        let mut runs: Vec<(usize, Vec<&CellValue>)> = Vec::new();
        for (col, value) in &self.cells {
            let adjacent = runs
                .last()
                .is_some_and(|(start, values)| start + values.len() == *col);
            if !adjacent {
                runs.push((*col, Vec::new()));
            }
            if let Some((_, values)) = runs.last_mut() {
                values.push(value);
            }
        }
        runs
    }
}

/// Minimal tabular access to a spreadsheet.
///
/// Rows come back as displayed strings; trailing empty cells may be
/// omitted, so rows can be shorter than the header.
#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, CallError>;

    /// Apply all updates in a single request.
    async fn write_rows(&self, sheet: &str, updates: &[RowUpdate]) -> Result<(), CallError>;

    /// Append one row after the last non-empty row.
    async fn append_row(&self, sheet: &str, values: &[String]) -> Result<(), CallError>;
}

// ---------------------------------------------------------------------------
// Upsert planning
// ---------------------------------------------------------------------------

/// The single batched write that brings a sheet up to date.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpsertPlan {
    pub updates: Vec<RowUpdate>,
    pub header_changed: bool,
    pub overwritten: usize,
    pub appended: usize,
}

fn normalise_header(cell: &str) -> String {
    cell.trim().to_lowercase()
}

/// Work out the write needed to upsert `rows` into a sheet whose current
/// contents are `existing`.
///
/// Columns are located by header name and missing owned columns are added
/// to the right of every existing cell. Only owned cells are written, so
/// values, formulas and formatting in other columns are never sent back.
/// A key appearing twice in `rows` ends with the later value.
pub fn plan_upsert(existing: &[Vec<String>], rows: &[SheetRow]) -> UpsertPlan {
    let header: &[String] = existing.first().map(Vec::as_slice).unwrap_or(&[]);
    let widest = existing.iter().map(Vec::len).max().unwrap_or(0);
    let first_data_row = 1;
    let original_len = existing.len().max(first_data_row);

    // row index -> column index -> value
    let mut pending: BTreeMap<usize, BTreeMap<usize, CellValue>> = BTreeMap::new();

    // Header fix-up.
    let mut positions: HashMap<Column, usize> = HashMap::new();
    let mut next_free = widest;
    for column in Column::ALL {
        match header.iter().position(|h| normalise_header(h) == column.header()) {
            Some(pos) => {
                positions.insert(*column, pos);
            }
            None => {
                positions.insert(*column, next_free);
                pending
                    .entry(0)
                    .or_default()
                    .insert(next_free, CellValue::text(column.header()));
                next_free += 1;
            }
        }
    }
    let header_changed = pending.contains_key(&0);

    // Existing keys, first occurrence wins.
    let ticker_pos = positions[&Column::Ticker];
    let date_pos = positions[&Column::RunDate];
    let mut index: HashMap<NaturalKey, usize> = HashMap::new();
    for (i, row) in existing.iter().enumerate().skip(first_data_row) {
        let ticker = row.get(ticker_pos).map(|s| s.trim()).unwrap_or("");
        let date = row.get(date_pos).map(|s| s.trim()).unwrap_or("");
        if ticker.is_empty() {
            continue;
        }
        if let Ok(date) = NaiveDate::parse_from_str(date, RUN_DATE_FORMAT) {
            index.entry(NaturalKey::new(ticker, date)).or_insert(i);
        }
    }

    let mut next_row = original_len;
    for row in rows {
        let idx = *index.entry(row.key.clone()).or_insert_with(|| {
            next_row += 1;
            next_row - 1
        });
        let target = pending.entry(idx).or_default();
        for (column, value) in row.cells() {
            target.insert(positions[column], value.clone());
        }
    }

    let overwritten = pending
        .keys()
        .filter(|&&i| i >= first_data_row && i < original_len)
        .count();
    let appended = pending.keys().filter(|&&i| i >= original_len).count();

    let updates = pending
        .into_iter()
        .map(|(row_index, cells)| RowUpdate {
            row_index,
            cells: cells.into_iter().collect(),
        })
        .collect();

    UpsertPlan {
        updates,
        header_changed,
        overwritten,
        appended,
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Outcome of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertSummary {
    pub overwritten: usize,
    pub appended: usize,
    pub header_changed: bool,
}

pub struct SheetSink {
    store: Arc<dyn SheetStore>,
    sheet: String,
    run_log_sheet: Option<String>,
    client: Arc<RateLimitedClient>,
}

impl SheetSink {
    pub fn new(store: Arc<dyn SheetStore>, sheet: impl Into<String>, client: Arc<RateLimitedClient>) -> Self {
        Self {
            store,
            sheet: sheet.into(),
            run_log_sheet: None,
            client,
        }
    }

    /// Also append a row per run to this tab.
    pub fn with_run_log(mut self, sheet: impl Into<String>) -> Self {
        self.run_log_sheet = Some(sheet.into()).filter(|s: &String| !s.trim().is_empty());
        self
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    /// Confirm the credentials work and the tab is readable before any
    /// ticker is analysed. Failure is a configuration error.
    pub async fn check_access(&self) -> Result<(), PipelineError> {
        let store = self.store.as_ref();
        let sheet = self.sheet.as_str();

        let rows = self
            .client
            .call(move || store.read_rows(sheet))
            .await
            .map_err(|e| PipelineError::ConfigurationFailed(format!("sheet `{sheet}` is not accessible: {e}")))?;
        debug!(sheet, rows = rows.len(), "Sheet access confirmed");
        Ok(())
    }

    /// Insert or overwrite one row per record, keyed by (ticker, run date).
    ///
    /// Reads the tab once and writes once. Any store failure left after
    /// retries is `PersistenceFailed`.
    pub async fn upsert(&self, records: &[AnalysisRecord], run_date: NaiveDate) -> Result<UpsertSummary, PipelineError> {
        let store = self.store.as_ref();
        let sheet = self.sheet.as_str();

        let existing = self
            .client
            .call(move || store.read_rows(sheet))
            .await
            .map_err(|e| PipelineError::PersistenceFailed(format!("reading `{sheet}`: {e}")))?;

        let rows: Vec<SheetRow> = records
            .iter()
            .map(|r| SheetRow::from_record(r, run_date))
            .collect();
        let plan = plan_upsert(&existing, &rows);

        debug!(
            sheet,
            existing_rows = existing.len(),
            updates = plan.updates.len(),
            "Upsert planned"
        );

        if !plan.updates.is_empty() {
            let updates = plan.updates.as_slice();
            self.client
                .call(move || store.write_rows(sheet, updates))
                .await
                .map_err(|e| PipelineError::PersistenceFailed(format!("writing `{sheet}`: {e}")))?;
        }

        let summary = UpsertSummary {
            overwritten: plan.overwritten,
            appended: plan.appended,
            header_changed: plan.header_changed,
        };

        info!(
            sheet,
            overwritten = summary.overwritten,
            appended = summary.appended,
            header_changed = summary.header_changed,
            "Records persisted"
        );

        Ok(summary)
    }

    /// Append one row to the run-log tab, writing its header first when the
    /// tab is empty. Failures are logged and swallowed.
    pub async fn append_run_log(&self, values: &[String]) {
        let Some(sheet) = self.run_log_sheet.as_deref() else {
            return;
        };
        if let Err(e) = self.try_append_run_log(sheet, values).await {
            warn!(sheet, error = %e, "Failed to append run log");
        }
    }

    async fn try_append_run_log(&self, sheet: &str, values: &[String]) -> Result<(), crate::net::ClientError> {
        let store = self.store.as_ref();

        let existing = self.client.call(move || store.read_rows(sheet)).await?;
        if existing.iter().all(|row| row.iter().all(|c| c.trim().is_empty())) {
            let header: Vec<String> = RUN_LOG_HEADER.iter().map(|h| h.to_string()).collect();
            let header = header.as_slice();
            self.client.call(move || store.append_row(sheet, header)).await?;
        }

        self.client.call(move || store.append_row(sheet, values)).await?;
        debug!(sheet, "Run log appended");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
