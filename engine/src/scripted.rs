//! A deterministic executor for demos and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use fanout_types::{BranchError, TransientCause};

use crate::executor::{BranchExecutor, ExecCtx, ExecFut};

/// How a scripted attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedFailure {
    /// Service unavailable.
    Transient,
    Fatal,
    /// Never returns; only a run timeout ends the attempt.
    Timeout,
    Panic,
}

/// Emits `events` payloads of the form `{"seq": i, "attempt": k}`, one every
/// `interval`, then fails its first `fail_attempts` attempts with `failure`
/// and succeeds afterwards.
#[derive(Debug, Clone)]
pub struct ScriptedExecutor {
    events: u32,
    interval: Duration,
    failure: Option<ScriptedFailure>,
    fail_attempts: u32,
    calls: Arc<AtomicU32>,
}

impl ScriptedExecutor {
    #[must_use]
    pub fn succeeding(events: u32) -> Self {
        Self {
            events,
            interval: Duration::ZERO,
            failure: None,
            fail_attempts: 0,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: u32) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fail attempts `1..=fail_attempts`. Use `u32::MAX` to fail forever.
    #[must_use]
    pub fn with_failure(mut self, failure: ScriptedFailure, fail_attempts: u32) -> Self {
        self.failure = Some(failure);
        self.fail_attempts = fail_attempts;
        self
    }

    /// Number of times `execute` has been invoked, shared across clones.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BranchExecutor for ScriptedExecutor {
    fn execute<'a>(&'a self, ctx: &'a ExecCtx) -> ExecFut<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let attempt = ctx.attempt();

            for seq in 0..self.events {
                if !self.interval.is_zero() {
                    tokio::time::sleep(self.interval).await;
                }
                ctx.emit(json!({"seq": seq, "attempt": attempt})).await?;
            }

            let Some(failure) = self.failure.filter(|_| attempt <= self.fail_attempts) else {
                return Ok(());
            };
            match failure {
                ScriptedFailure::Transient => Err(BranchError::transient(
                    TransientCause::Unavailable,
                    format!("scripted outage on attempt {attempt}"),
                )),
                ScriptedFailure::Fatal => Err(BranchError::fatal(format!(
                    "scripted fatal error on attempt {attempt}"
                ))),
                ScriptedFailure::Timeout => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                ScriptedFailure::Panic => panic!("scripted panic on attempt {attempt}"),
            }
        })
    }
}
