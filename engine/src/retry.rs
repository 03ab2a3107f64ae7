//! Branch retry policy with exponential backoff and jitter.
//!
//! # Policy
//!
//! - Attempt `k` (1-based) that fails retryably is retried iff `k <= max_retries`,
//!   so a branch makes at most `max_retries + 1` attempts.
//! - Transient failures back off exponentially:
//!   `min(max_delay, base_delay * 2^(k-1))`, then jittered by a factor in
//!   `[1 - jitter, 1 + jitter]`.
//! - Timeouts use a flat `base_delay * (1 + U(0, 1))`; the timeout itself already
//!   bounds how fast a timing-out branch can spin.
//! - Every delay is floored at [`MIN_RETRY_DELAY`].
//! - Fatal failures are never retried.
//!
//! The policy is pure apart from the random sample; the `*_with_sample`
//! variants take the sample explicitly.

use std::time::Duration;

use fanout_types::{BranchError, ErrorKind, RunConfig};

/// Lower bound on any retry delay.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

// 2^62 already saturates any sane max_delay.
const MAX_BACKOFF_EXPONENT: u32 = 62;

/// What to do after a failed attempt.
///
/// A sum type so callers can tell a budget running out apart from an error
/// that was never worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then run the branch again from the start.
    Retry { delay: Duration },
    /// Retryable failure, but the retry budget is spent.
    Exhausted,
    /// Not retryable.
    Fatal,
}

impl RetryDecision {
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Decide whether attempt `attempt` (1-based) should be retried after `error`.
#[must_use]
pub fn decide(error: &BranchError, attempt: u32, config: &RunConfig) -> RetryDecision {
    decide_with_sample(error, attempt, config, rand::random::<f64>())
}

/// [`decide`] with an explicit uniform sample in `[0, 1]`.
#[must_use]
pub fn decide_with_sample(
    error: &BranchError,
    attempt: u32,
    config: &RunConfig,
    sample: f64,
) -> RetryDecision {
    // Fatal wins over an exhausted budget.
    let delay = match error.kind() {
        ErrorKind::Fatal => return RetryDecision::Fatal,
        _ if attempt > config.max_retries() => return RetryDecision::Exhausted,
        ErrorKind::Timeout => timeout_delay(config.base_delay(), sample),
        ErrorKind::Transient(_) => backoff_delay(attempt, config, sample),
    };
    RetryDecision::Retry { delay }
}

/// Exponential backoff for attempt `attempt` (1-based) with multiplicative jitter.
///
/// `sample` in `[0, 1]` maps linearly onto a jitter factor in
/// `[1 - jitter, 1 + jitter]`.
#[must_use]
pub fn backoff_delay(attempt: u32, config: &RunConfig, sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as i32;
    let base = config.base_delay().as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay().as_secs_f64());

    let spread = sample.clamp(0.0, 1.0).mul_add(2.0, -1.0);
    let jittered = capped * config.jitter().mul_add(spread, 1.0);
    floor_delay(jittered)
}

/// Flat delay used after a timeout: `base_delay * (1 + sample)`.
#[must_use]
pub fn timeout_delay(base_delay: Duration, sample: f64) -> Duration {
    floor_delay(base_delay.as_secs_f64() * (1.0 + sample.clamp(0.0, 1.0)))
}

fn floor_delay(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MIN_RETRY_DELAY)
        .max(MIN_RETRY_DELAY)
}
