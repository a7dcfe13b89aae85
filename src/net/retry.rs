//! Retry policy and the per-call retry state machine.
//!
//! The state machine has no I/O: `RateLimitedClient` feeds it call
//! outcomes and performs whatever the resulting state asks for (issue an
//! attempt, sleep, or stop). That keeps backoff, jitter and attempt
//! accounting testable without a network.

use std::time::Duration;

/// Backoff and attempt limits for one dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles afterwards.
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay (before jitter).
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables it).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempt` (1-based) failed.
    ///
    /// `jitter_sample` is expected in `[0, 1)`; it scales the jitter
    /// fraction so callers can inject a fixed value in tests.
    pub fn backoff_delay(&self, failed_attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);

        let fraction = self.jitter.clamp(0.0, 1.0) * jitter_sample.clamp(0.0, 1.0);
        capped + capped.mul_f64(fraction)
    }
}

/// Where a single logical call is in its retry lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    /// About to issue attempt number `attempt` (1-based).
    Attempting { attempt: u32 },
    /// Attempt `attempt` failed transiently; wait `delay` before the next.
    BackingOff { attempt: u32, delay: Duration },
    /// All attempts failed transiently.
    Exhausted { attempts: u32 },
    /// Attempt `attempts` succeeded.
    Succeeded { attempts: u32 },
    /// Attempt `attempts` failed in a way retrying cannot fix.
    Rejected { attempts: u32 },
}

impl RetryState {
    pub fn start() -> Self {
        RetryState::Attempting { attempt: 1 }
    }

    pub fn on_success(self) -> Self {
        match self {
            RetryState::Attempting { attempt } => RetryState::Succeeded { attempts: attempt },
            other => other,
        }
    }

    pub fn on_transient_failure(self, policy: &RetryPolicy, jitter_sample: f64) -> Self {
        match self {
            RetryState::Attempting { attempt } if attempt >= policy.max_attempts.max(1) => {
                RetryState::Exhausted { attempts: attempt }
            }
            RetryState::Attempting { attempt } => RetryState::BackingOff {
                attempt,
                delay: policy.backoff_delay(attempt, jitter_sample),
            },
            other => other,
        }
    }

    pub fn on_permanent_failure(self) -> Self {
        match self {
            RetryState::Attempting { attempt } => RetryState::Rejected { attempts: attempt },
            other => other,
        }
    }

    /// Leave `BackingOff` once the delay has elapsed.
    pub fn resume(self) -> Self {
        match self {
            RetryState::BackingOff { attempt, .. } => RetryState::Attempting { attempt: attempt + 1 },
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Exhausted { .. } | RetryState::Succeeded { .. } | RetryState::Rejected { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
