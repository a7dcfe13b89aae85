//! Synthesis engine — turns a snapshot and search context into an analysis.
//!
//! Sends one structured request to the language model and validates the
//! reply against a typed schema. A reply that fails validation gets
//! exactly one corrective re-request carrying the parse error.

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::{ChatMessage, LanguageModel, Prompt};
use crate::types::{MarketSnapshot, PipelineError, SearchResult};

/// Inclusive score range requested from the model.
pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

/// Insights kept per record; extras are dropped.
pub const MAX_INSIGHTS: usize = 5;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// A validated model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisBody {
    pub summary: String,
    /// Within `[SCORE_MIN, SCORE_MAX]`, one decimal.
    pub score: f64,
    pub citations: Vec<String>,
    pub insights: Vec<String>,
}

/// Why a model reply was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("reply contains no JSON object")]
    NoJson,

    #[error("reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("score {0} is outside [0, 10]")]
    ScoreOutOfRange(f64),

    #[error("summary is empty")]
    EmptySummary,
}

/// Pull the JSON object out of a reply: a multi-line fenced block, or the
/// span from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        if let Some((_, rest)) = trimmed.split_once('\n') {
            let inner = rest.rfind("```").map_or(rest, |end| &rest[..end]).trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&trimmed[start..=end])
}

fn string_list(obj: &Map<String, Value>, field: &'static str) -> Result<Option<Vec<String>>, SchemaError> {
    let wrong = SchemaError::WrongType {
        field,
        expected: "an array of strings",
    };
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(|s| s.trim().to_string()).ok_or_else(|| wrong.clone()))
            .filter(|r| !matches!(r, Ok(s) if s.is_empty()))
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(wrong),
    }
}

/// Validate a raw reply against the synthesis schema.
pub fn parse_response(text: &str) -> Result<SynthesisBody, SchemaError> {
    let json = extract_json(text).ok_or(SchemaError::NoJson)?;
    let value: Value = serde_json::from_str(json).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
    let obj = value.as_object().ok_or(SchemaError::WrongType {
        field: "reply",
        expected: "a JSON object",
    })?;

    let summary = obj
        .get("summary")
        .ok_or(SchemaError::MissingField("summary"))?
        .as_str()
        .ok_or(SchemaError::WrongType {
            field: "summary",
            expected: "a string",
        })?
        .trim()
        .to_string();
    if summary.is_empty() {
        return Err(SchemaError::EmptySummary);
    }

    let raw_score = obj
        .get("score")
        .ok_or(SchemaError::MissingField("score"))?
        .as_f64()
        .ok_or(SchemaError::WrongType {
            field: "score",
            expected: "a number",
        })?;
    if !raw_score.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&raw_score) {
        return Err(SchemaError::ScoreOutOfRange(raw_score));
    }
    let score = ((raw_score * 10.0).round() / 10.0).clamp(SCORE_MIN, SCORE_MAX);

    let citations = string_list(obj, "citations")?.ok_or(SchemaError::MissingField("citations"))?;
    let mut insights = string_list(obj, "insights")?.unwrap_or_default();
    insights.truncate(MAX_INSIGHTS);

    Ok(SynthesisBody {
        summary,
        score,
        citations,
        insights,
    })
}

/// Keep only citations that name a supplied search result, first
/// occurrence wins.
pub fn filter_citations(citations: Vec<String>, results: &[SearchResult]) -> Vec<String> {
    let allowed: HashSet<&str> = results.iter().map(|r| r.url.trim()).collect();
    let mut seen = HashSet::new();
    citations
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| allowed.contains(c.as_str()) && seen.insert(c.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are an equity research assistant. You receive quantitative \
market data and recent web search results for one listed company and write a short, \
factual assessment.\n\n\
Respond with a single JSON object and nothing else, with exactly these fields:\n\
- \"summary\": string, two to four sentences.\n\
- \"score\": number from 0 to 10, where 0 is very unattractive and 10 very attractive.\n\
- \"citations\": array of URLs, taken only from the search results you relied on.\n\
- \"insights\": array of up to three short bullet-point insights.\n\n\
Do not invent figures. If data is missing, say so in the summary.";

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => format!("{v:.4}"),
        None => "n/a".to_string(),
    }
}

/// Build the initial request for one ticker.
pub fn build_prompt(snapshot: &MarketSnapshot, results: &[SearchResult]) -> Prompt {
    let mut body = String::with_capacity(2000);

    match &snapshot.company_name {
        Some(name) => body.push_str(&format!("TICKER: {} ({name})\n", snapshot.ticker)),
        None => body.push_str(&format!("TICKER: {}\n", snapshot.ticker)),
    }
    body.push_str(&format!("AS OF: {}\n", snapshot.as_of.format("%Y-%m-%d %H:%M UTC")));

    body.push_str("\nMARKET DATA:\n");
    for (name, value) in snapshot.fields() {
        body.push_str(&format!("- {name}: {}\n", format_value(value)));
    }

    body.push_str("\nSEARCH RESULTS:\n");
    if results.is_empty() {
        body.push_str("(none available)\n");
    }
    for (i, r) in results.iter().enumerate() {
        body.push_str(&format!("[{}] {}\n    {}\n    URL: {}\n", i + 1, r.title, r.snippet, r.url));
    }

    body.push_str("\nReturn the JSON object now.\n");

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        messages: vec![ChatMessage::user(body)],
    }
}

fn correction_message(error: &SchemaError) -> String {
    format!(
        "Your previous reply could not be used: {error}. \
         Reply again with only the JSON object, with fields summary (string), \
         score (number 0-10), citations (array of URLs) and insights (array of strings)."
    )
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SynthesisEngine {
    model: Arc<dyn LanguageModel>,
}

impl SynthesisEngine {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Approximate model spend so far, in USD.
    pub fn cumulative_cost(&self) -> Decimal {
        self.model.cumulative_cost()
    }

    /// Produce a validated analysis, or `SynthesisFailed` with the reason.
    pub async fn synthesize(
        &self,
        snapshot: &MarketSnapshot,
        results: &[SearchResult],
    ) -> Result<SynthesisBody, PipelineError> {
        let ticker = snapshot.ticker.as_str();
        let failed = |message: String| PipelineError::SynthesisFailed {
            ticker: ticker.to_string(),
            message,
        };

        let mut prompt = build_prompt(snapshot, results);
        let reply = self
            .model
            .complete(&prompt)
            .await
            .map_err(|e| failed(format!("model call failed: {e}")))?;

        let body = match parse_response(&reply) {
            Ok(body) => body,
            Err(first_error) => {
                warn!(ticker, error = %first_error, "Model reply rejected, asking for a correction");
                prompt.messages.push(ChatMessage::assistant(reply));
                prompt.messages.push(ChatMessage::user(correction_message(&first_error)));

                let retry = self
                    .model
                    .complete(&prompt)
                    .await
                    .map_err(|e| failed(format!("model call failed: {e}")))?;

                parse_response(&retry)
                    .map_err(|e| failed(format!("invalid model output after correction: {e}")))?
            }
        };

        let offered = body.citations.len();
        let citations = filter_citations(body.citations, results);
        if citations.len() < offered {
            debug!(ticker, dropped = offered - citations.len(), "Dropped citations outside the search results");
        }

        Ok(SynthesisBody { citations, ..body })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
