//! Drives one branch from admission to its terminal result.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use fanout_types::{
    Attempt, AttemptOutcome, BranchError, BranchResult, ErrorKind, Event, RunConfig,
};

use crate::executor::{AttemptHandle, AttemptStep, Branch};
use crate::gate::ConcurrencyGate;
use crate::relay::RelaySender;
use crate::retry::{self, RetryDecision};
use crate::store::{StateStore, record_branch_error};

pub(crate) struct BranchRunner {
    pub(crate) branch: Branch,
    pub(crate) config: Arc<RunConfig>,
    pub(crate) gate: ConcurrencyGate,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) relay: RelaySender,
    pub(crate) context: Arc<Value>,
}

impl BranchRunner {
    /// Run the branch to completion. Never fails: every error is folded into
    /// the returned result.
    pub(crate) async fn run(mut self) -> BranchResult {
        let id = self.branch.id().clone();
        let output_key = self.branch.output_key().to_string();

        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                let result = BranchResult::failed(id, output_key, e.to_string(), 0);
                self.record_failure(&result).await;
                return result;
            }
        };
        tracing::debug!(branch = %id, "branch admitted");

        let mut attempt = Attempt::begin(id.clone(), 1);
        let result = loop {
            let error = match self.run_attempt(attempt.number()).await {
                Ok(()) => {
                    attempt.finish(AttemptOutcome::Success);
                    break BranchResult::succeeded(id.clone(), &output_key, attempt.number());
                }
                Err(error) => error,
            };
            attempt.finish(outcome_for(&error));

            match retry::decide(&error, attempt.number(), &self.config) {
                RetryDecision::Retry { delay } => {
                    tracing::warn!(
                        branch = %id,
                        attempt = attempt.number(),
                        delay_ms = duration_ms(delay),
                        error = %error,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.next();
                }
                RetryDecision::Exhausted => {
                    let message = format!(
                        "{error} (gave up after {} attempts)",
                        attempt.number()
                    );
                    break BranchResult::failed(
                        id.clone(),
                        &output_key,
                        message,
                        attempt.number(),
                    );
                }
                RetryDecision::Fatal => {
                    break BranchResult::failed(
                        id.clone(),
                        &output_key,
                        error.to_string(),
                        attempt.number(),
                    );
                }
            }
        };
        permit.release();

        if let Some(error) = result.error() {
            tracing::warn!(branch = %id, attempts = result.attempts(), error = %error, "branch failed");
            self.record_failure(&result).await;
        } else {
            tracing::debug!(branch = %id, attempts = result.attempts(), "branch succeeded");
        }
        result
    }

    async fn run_attempt(&mut self, number: u32) -> Result<(), BranchError> {
        let mut handle = AttemptHandle::spawn(
            &self.branch,
            number,
            Arc::clone(&self.context),
            self.config.event_buffer(),
        );

        // A limit too large to express as an instant never fires.
        let Some((limit, deadline)) = self
            .config
            .timeout()
            .and_then(|limit| Some((limit, Instant::now().checked_add(limit)?)))
        else {
            loop {
                match handle.next().await {
                    AttemptStep::Event(payload) => self.forward(number, payload).await,
                    AttemptStep::Finished(result) => return result,
                }
            }
        };

        loop {
            match tokio::time::timeout_at(deadline, handle.next()).await {
                Ok(AttemptStep::Event(payload)) => self.forward(number, payload).await,
                Ok(AttemptStep::Finished(result)) => return result,
                Err(_) => {
                    // Anything emitted before the deadline is still delivered.
                    for payload in handle.cancel() {
                        self.forward(number, payload).await;
                    }
                    return Err(BranchError::timeout(limit));
                }
            }
        }
    }

    /// Write the error key off the async worker; store adapters may block.
    /// A panicking store still takes the runner down with it.
    async fn record_failure(&self, result: &BranchResult) {
        let store = Arc::clone(&self.store);
        let record = result.clone();
        let write =
            tokio::task::spawn_blocking(move || record_branch_error(store.as_ref(), &record));
        if let Err(e) = write.await {
            match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(e) => tracing::warn!(
                    branch = %result.branch_id(),
                    error = %e,
                    "branch error write did not complete"
                ),
            }
        }
    }

    async fn forward(&mut self, attempt: u32, payload: Value) {
        let event = Event::new(self.branch.id().clone(), attempt, payload);
        self.relay.forward(event).await;
    }
}

fn outcome_for(error: &BranchError) -> AttemptOutcome {
    match error.kind() {
        ErrorKind::Transient(_) => AttemptOutcome::TransientError,
        ErrorKind::Timeout => AttemptOutcome::Timeout,
        ErrorKind::Fatal => AttemptOutcome::FatalError,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
