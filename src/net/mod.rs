//! Rate-limited, retrying access to external dependencies.
//!
//! Every provider call (market data, search, LLM, spreadsheet) goes
//! through a `RateLimitedClient`. One client exists per dependency and is
//! shared by all tickers, so running tickers concurrently never raises
//! the call rate against a provider above its configured ceiling.

pub mod retry;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub use retry::{RetryPolicy, RetryState};

use crate::types::PipelineError;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Longest provider body excerpt kept in error messages.
const ERROR_BODY_LIMIT: usize = 300;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Outcome classification of a single attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// Timeout, connection failure, 5xx or explicit rate limiting.
    #[error("transient: {0}")]
    Transient(String),
    /// Authentication, bad request or an unusable response.
    #[error("non-transient: {0}")]
    NonTransient(String),
}

/// Final outcome of a call after the retry loop.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("{dependency} rejected the request: {message}")]
    NonTransient { dependency: String, message: String },

    #[error("{dependency} still failing after {attempts} attempts: {last_error}")]
    Exhausted {
        dependency: String,
        attempts: u32,
        last_error: String,
    },
}

impl From<ClientError> for PipelineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NonTransient { dependency, message } => {
                PipelineError::NonTransient { dependency, message }
            }
            ClientError::Exhausted {
                dependency,
                attempts,
                last_error,
            } => PipelineError::Transient {
                dependency,
                message: format!("exhausted after {attempts} attempts: {last_error}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Wraps one external dependency with a call-rate ceiling and retries.
pub struct RateLimitedClient {
    name: String,
    limiter: Option<DirectRateLimiter>,
    policy: RetryPolicy,
    total_calls: AtomicU64,
    total_retries: AtomicU64,
}

impl RateLimitedClient {
    /// `min_interval` is the minimum spacing between attempts against this
    /// dependency; `None` or zero disables rate limiting.
    pub fn new(name: impl Into<String>, min_interval: Option<Duration>, policy: RetryPolicy) -> Self {
        let limiter = min_interval
            .and_then(Quota::with_period)
            .map(RateLimiter::direct);

        Self {
            name: name.into(),
            limiter,
            policy,
            total_calls: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attempts issued so far, retries included.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Run `operation` under the rate limit, retrying transient failures.
    ///
    /// `operation` is invoked once per attempt and must build its request
    /// from scratch each time.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut state = RetryState::start();
        let mut value: Option<T> = None;
        let mut last_error = String::new();

        loop {
            match state {
                RetryState::Attempting { attempt } => {
                    if let Some(limiter) = &self.limiter {
                        limiter.until_ready().await;
                    }
                    self.total_calls.fetch_add(1, Ordering::Relaxed);

                    state = match operation().await {
                        Ok(v) => {
                            value = Some(v);
                            state.on_success()
                        }
                        Err(CallError::Transient(msg)) => {
                            warn!(dependency = %self.name, attempt, error = %msg, "Transient failure");
                            last_error = msg;
                            state.on_transient_failure(&self.policy, rand::random::<f64>())
                        }
                        Err(CallError::NonTransient(msg)) => {
                            warn!(dependency = %self.name, attempt, error = %msg, "Non-transient failure");
                            last_error = msg;
                            state.on_permanent_failure()
                        }
                    };
                }
                RetryState::BackingOff { attempt, delay } => {
                    debug!(
                        dependency = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    state = state.resume();
                }
                RetryState::Succeeded { attempts } => {
                    if attempts > 1 {
                        debug!(dependency = %self.name, attempts, "Call succeeded after retries");
                    }
                    return value.ok_or_else(|| ClientError::NonTransient {
                        dependency: self.name.clone(),
                        message: "call succeeded without a value".to_string(),
                    });
                }
                RetryState::Rejected { .. } => {
                    return Err(ClientError::NonTransient {
                        dependency: self.name.clone(),
                        message: last_error,
                    });
                }
                RetryState::Exhausted { attempts } => {
                    return Err(ClientError::Exhausted {
                        dependency: self.name.clone(),
                        attempts,
                        last_error,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP classification helpers
// ---------------------------------------------------------------------------

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode, body: &str) -> CallError {
    let message = format!("HTTP {status}: {}", truncate(body, ERROR_BODY_LIMIT));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        CallError::Transient(message)
    } else {
        CallError::NonTransient(message)
    }
}

/// Classify a transport-level reqwest error.
pub fn classify_transport(err: &reqwest::Error) -> CallError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        CallError::Transient(format!("request error: {err}"))
    } else {
        CallError::NonTransient(format!("request error: {err}"))
    }
}

/// Send a request and decode a successful JSON body.
pub async fn send_json(request: reqwest::RequestBuilder) -> Result<serde_json::Value, CallError> {
    let response = request.send().await.map_err(|e| classify_transport(&e))?;
    let status = response.status();
    let text = response.text().await.map_err(|e| classify_transport(&e))?;

    if !status.is_success() {
        return Err(classify_status(status, &text));
    }

    serde_json::from_str(&text).map_err(|e| {
        CallError::NonTransient(format!(
            "response is not valid JSON ({e}): {}",
            truncate(&text, ERROR_BODY_LIMIT)
        ))
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
