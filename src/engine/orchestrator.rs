//! Pipeline orchestrator — snapshot → search → synthesis → record, per
//! ticker, then one upsert for the whole run.
//!
//! Tickers run on a bounded pool and every ticker yields exactly one
//! record, in configured order. Only persistence failures escape a run.

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::report::{RunOutcome, RunReport};
use super::synthesis::SynthesisEngine;
use crate::data::{MarketDataSource, SearchContextSource};
use crate::storage::SheetSink;
use crate::types::{AnalysisRecord, PipelineError, RecordStatus, Ticker};

/// Reason recorded for tickers still running when the deadline hits.
pub const DEADLINE_REASON: &str = "run deadline exceeded";

/// Per-run parameters.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub run_date: NaiveDate,
    /// Tickers in flight at once; values below 1 are treated as 1.
    pub concurrency: usize,
    /// Budget for the analysis phase. Persistence runs regardless.
    pub deadline: Option<Duration>,
}

impl RunSettings {
    pub fn new(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            concurrency: 1,
            deadline: None,
        }
    }
}

pub struct PipelineOrchestrator {
    market: Arc<dyn MarketDataSource>,
    search: Arc<dyn SearchContextSource>,
    synthesis: SynthesisEngine,
    settings: RunSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        search: Arc<dyn SearchContextSource>,
        synthesis: SynthesisEngine,
        settings: RunSettings,
    ) -> Self {
        Self {
            market,
            search,
            synthesis,
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Analyse one ticker. Never fails: problems become the record's
    /// status and reason.
    pub async fn analyze_ticker(&self, ticker: &Ticker) -> AnalysisRecord {
        let symbol = ticker.symbol.trim().to_uppercase();
        let run_date = self.settings.run_date;

        let snapshot = match self.market.snapshot(ticker).await {
            Ok(s) => s,
            Err(e) => {
                warn!(ticker = %symbol, source = self.market.name(), error = %e, "Market data unavailable");
                return AnalysisRecord::failed(symbol, run_date, e.to_string());
            }
        };

        let (results, degraded) = match self.search.search(ticker).await {
            Ok(r) => (r, None),
            Err(e) => {
                warn!(ticker = %symbol, source = self.search.name(), error = %e, "Search context unavailable");
                (Vec::new(), Some(format!("search context unavailable: {e}")))
            }
        };

        match self.synthesis.synthesize(&snapshot, &results).await {
            Ok(body) => AnalysisRecord {
                ticker: symbol,
                run_date,
                summary: Some(body.summary),
                score: Some(body.score),
                citations: body.citations,
                insights: body.insights,
                status: if degraded.is_some() {
                    RecordStatus::Partial
                } else {
                    RecordStatus::Ok
                },
                reason: degraded,
            },
            Err(e) => {
                warn!(ticker = %symbol, error = %e, "Synthesis failed");
                AnalysisRecord::failed(symbol, run_date, e.to_string())
            }
        }
    }

    /// Analyse every ticker, returning records in input order.
    ///
    /// When the deadline passes, in-flight and unstarted tickers are
    /// recorded as failed.
    pub async fn analyze_all(&self, tickers: &[Ticker]) -> Vec<AnalysisRecord> {
        let mut slots: Vec<Option<AnalysisRecord>> = vec![None; tickers.len()];

        let mut pending = stream::iter(tickers.iter().enumerate())
            .map(|(i, ticker)| async move { (i, self.analyze_ticker(ticker).await) })
            .buffer_unordered(self.settings.concurrency.max(1));

        let deadline = async {
            match self.settings.deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((i, record)) => slots[i] = Some(record),
                    None => break,
                },
                _ = &mut deadline => {
                    let unfinished = slots.iter().filter(|s| s.is_none()).count();
                    warn!(unfinished, "Run deadline exceeded, abandoning remaining tickers");
                    break;
                }
            }
        }
        drop(pending);

        slots
            .into_iter()
            .zip(tickers)
            .map(|(slot, ticker)| {
                slot.unwrap_or_else(|| {
                    AnalysisRecord::failed(ticker.symbol.trim().to_uppercase(), self.settings.run_date, DEADLINE_REASON)
                })
            })
            .collect()
    }

    /// Check sheet access, analyse all tickers, persist the records, and
    /// append the run log.
    ///
    /// Ticker-level failures are reflected in the records. An unreachable
    /// sheet fails the run before any provider is called, and a failed
    /// upsert is returned as an error.
    pub async fn run(&self, tickers: &[Ticker], sink: &SheetSink) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let run_date = self.settings.run_date;
        let span = tracing::info_span!("run", %run_id, %run_date);

        async move {
            let started_at = Utc::now();
            let timer = Instant::now();

            sink.check_access().await?;

            info!(
                tickers = tickers.len(),
                concurrency = self.settings.concurrency,
                deadline_secs = self.settings.deadline.map(|d| d.as_secs()),
                "Run started"
            );

            let records = self.analyze_all(tickers).await;
            for r in &records {
                info!(
                    ticker = %r.ticker,
                    status = %r.status,
                    score = ?r.score,
                    citations = r.citations.len(),
                    reason = r.reason.as_deref().unwrap_or(""),
                    "Ticker complete"
                );
            }

            let persisted = sink.upsert(&records, run_date).await;

            let report = RunReport::from_records(
                run_id,
                run_date,
                started_at,
                &records,
                timer.elapsed(),
                self.synthesis.cumulative_cost(),
            );
            let outcome = match &persisted {
                Ok(_) => RunOutcome::Persisted,
                Err(_) => RunOutcome::PersistenceFailed,
            };
            sink.append_run_log(&report.log_row(outcome)).await;

            persisted?;
            info!(
                ok = report.ok,
                partial = report.partial,
                failed = report.failed,
                elapsed_secs = format!("{:.1}", report.elapsed.as_secs_f64()),
                llm_cost = format!("${:.4}", report.llm_cost),
                "Run complete"
            );
            Ok::<_, PipelineError>(report)
        }
        .instrument(span)
        .await
    }
}
