//! Run configuration shared across crates.
//!
//! `RunConfig` is immutable once a run starts. Programmatic callers adjust the
//! defaults with the `with_*` setters; the orchestrator calls
//! [`RunConfig::validate`] before admitting any branch, and the TOML loader
//! validates at the parse boundary.

use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENCY: usize = 6;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
pub const DEFAULT_JITTER: f64 = 0.25;
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunConfigError {
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("base_delay must be greater than zero")]
    NonPositiveBaseDelay,
    #[error("max_delay ({max_delay:?}) must not be below base_delay ({base_delay:?})")]
    MaxDelayBelowBase {
        base_delay: Duration,
        max_delay: Duration,
    },
    #[error("jitter must be within [0, 1], got {0}")]
    JitterOutOfRange(f64),
    #[error("timeout must be greater than zero")]
    NonPositiveTimeout,
    #[error("event_buffer must be at least 1")]
    ZeroEventBuffer,
}

/// Limits and retry tuning for one orchestrator run.
///
/// ```rust
/// use std::time::Duration;
/// use fanout_types::RunConfig;
///
/// let config = RunConfig::default()
///     .with_max_concurrency(2)
///     .with_timeout(Some(Duration::from_secs(30)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    max_concurrency: usize,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    timeout: Option<Duration>,
    event_buffer: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            timeout: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.max_concurrency == 0 {
            return Err(RunConfigError::ZeroConcurrency);
        }
        if self.base_delay.is_zero() {
            return Err(RunConfigError::NonPositiveBaseDelay);
        }
        if self.max_delay < self.base_delay {
            return Err(RunConfigError::MaxDelayBelowBase {
                base_delay: self.base_delay,
                max_delay: self.max_delay,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RunConfigError::JitterOutOfRange(self.jitter));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(RunConfigError::NonPositiveTimeout);
        }
        if self.event_buffer == 0 {
            return Err(RunConfigError::ZeroEventBuffer);
        }
        Ok(())
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set both ends of the backoff range.
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Capacity of each branch's bounded event queue.
    #[must_use]
    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }
}
