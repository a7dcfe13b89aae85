//! Run report — counts, timing and model spend for one run.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::types::{AnalysisRecord, RecordStatus, RUN_DATE_FORMAT};

/// How the run ended at the persistence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Persisted,
    PersistenceFailed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Persisted => write!(f, "persisted"),
            RunOutcome::PersistenceFailed => write!(f, "persistence failed"),
        }
    }
}

/// Summary of a complete analyse → persist run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub tickers: usize,
    pub ok: usize,
    pub partial: usize,
    pub failed: usize,
    pub elapsed: Duration,
    /// Approximate LLM spend, USD.
    pub llm_cost: Decimal,
}

impl RunReport {
    pub fn from_records(
        run_id: Uuid,
        run_date: NaiveDate,
        started_at: DateTime<Utc>,
        records: &[AnalysisRecord],
        elapsed: Duration,
        llm_cost: Decimal,
    ) -> Self {
        let count = |status: RecordStatus| records.iter().filter(|r| r.status == status).count();
        Self {
            run_id,
            run_date,
            started_at,
            tickers: records.len(),
            ok: count(RecordStatus::Ok),
            partial: count(RecordStatus::Partial),
            failed: count(RecordStatus::Failed),
            elapsed,
            llm_cost,
        }
    }

    /// One row for the run-log tab, in `RUN_LOG_HEADER` order.
    pub fn log_row(&self, outcome: RunOutcome) -> Vec<String> {
        vec![
            self.started_at.to_rfc3339(),
            self.run_date.format(RUN_DATE_FORMAT).to_string(),
            self.tickers.to_string(),
            self.ok.to_string(),
            self.partial.to_string(),
            self.failed.to_string(),
            format!("{:.1}", self.elapsed.as_secs_f64()),
            outcome.to_string(),
        ]
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} for {}: {} tickers ({} ok, {} partial, {} failed) in {:.1}s, llm cost ${:.4}",
            self.run_id,
            self.run_date.format(RUN_DATE_FORMAT),
            self.tickers,
            self.ok,
            self.partial,
            self.failed,
            self.elapsed.as_secs_f64(),
            self.llm_cost
        )
    }
}
