//! Run lifecycle: admission, fan-out, event drain, and the health record.
//!
//! ```text
//! Orchestrator ──run()──► RunHandle[Running] ──all results in──► [Draining]
//!                                                                   │
//!                                     relay empty, health written ◄─┘
//!                                                   │
//!                                              [Completed]
//! ```
//!
//! The not-yet-started state is the [`Orchestrator`] value itself; `run`
//! consumes it, so a run object cannot be reused.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use futures_util::stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use fanout_types::{BranchId, BranchResult, Event, HealthSnapshot, RunConfig, RunConfigError};

use crate::executor::Branch;
use crate::gate::ConcurrencyGate;
use crate::relay::EventRelay;
use crate::runner::BranchRunner;
use crate::store::{StateStore, record_branch_error, record_health};

/// Message recorded for a branch whose runner task died without reporting.
const RUNNER_LOST_MESSAGE: &str = "branch runner terminated unexpectedly";

/// Synchronous admission failure. No branch has started when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid run configuration: {0}")]
    InvalidConfig(#[from] RunConfigError),
    #[error("duplicate branch id: {0}")]
    DuplicateBranchId(BranchId),
    #[error("branch at position {index} has an empty id")]
    EmptyBranchId { index: usize },
    #[error("branch {0} has an empty output key")]
    EmptyOutputKey(BranchId),
}

/// Entry point for one run.
pub struct Orchestrator {
    run_name: String,
    store: Arc<dyn StateStore>,
    context: Arc<Value>,
}

impl Orchestrator {
    /// New orchestrator writing to `store`, with a unique generated run name.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            run_name: format!("run-{}", Uuid::new_v4()),
            store,
            context: Arc::new(Value::Null),
        }
    }

    #[must_use]
    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = run_name.into();
        self
    }

    /// Context every executor receives through [`crate::ExecCtx::shared`].
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Arc::new(context);
        self
    }

    #[must_use]
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Validate, admit, and start every branch.
    ///
    /// Must be called from within a Tokio runtime. Branches start running
    /// immediately; consume the returned handle to exhaustion to get the
    /// health record written.
    pub fn run(self, branches: Vec<Branch>, config: RunConfig) -> Result<RunHandle, RunError> {
        config.validate()?;
        admit(&branches)?;

        let started_at = Utc::now();
        let config = Arc::new(config);
        let gate = ConcurrencyGate::new(config.max_concurrency());
        let mut relay = EventRelay::new(config.event_buffer());
        let (results_tx, results_rx) = mpsc::channel(branches.len().max(1));

        tracing::info!(
            run = %self.run_name,
            branches = branches.len(),
            max_concurrency = config.max_concurrency(),
            max_retries = config.max_retries(),
            "run started"
        );

        let mut slots = Vec::with_capacity(branches.len());
        for (index, branch) in branches.into_iter().enumerate() {
            slots.push(Slot {
                branch_id: branch.id().clone(),
                output_key: branch.output_key().to_string(),
                result: None,
            });

            let runner = BranchRunner {
                branch,
                config: Arc::clone(&config),
                gate: gate.clone(),
                store: Arc::clone(&self.store),
                relay: relay.register(),
                context: Arc::clone(&self.context),
            };
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let result = runner.run().await;
                // The handle may already be gone; the result is in the store.
                let _ = results_tx.send((index, result)).await;
            });
        }
        drop(results_tx);

        let pending = slots.len();
        Ok(RunHandle {
            run_name: self.run_name,
            started_at,
            store: self.store,
            state: RunState::Active(ActiveRun {
                phase: ActivePhase::Running,
                relay,
                results_rx,
                slots,
                pending,
            }),
        })
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_name", &self.run_name)
            .finish_non_exhaustive()
    }
}

fn admit(branches: &[Branch]) -> Result<(), RunError> {
    let mut seen = HashSet::with_capacity(branches.len());
    for (index, branch) in branches.iter().enumerate() {
        if branch.id().is_blank() {
            return Err(RunError::EmptyBranchId { index });
        }
        if branch.output_key().trim().is_empty() {
            return Err(RunError::EmptyOutputKey(branch.id().clone()));
        }
        if !seen.insert(branch.id().as_str()) {
            return Err(RunError::DuplicateBranchId(branch.id().clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Branches are running; events and results are both flowing.
    Running,
    /// Every branch has a result; buffered events are still being delivered.
    Draining,
    /// Health record written. Terminal.
    Completed,
}

/// Terminal report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    run_name: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    results: Vec<BranchResult>,
    health: HealthSnapshot,
}

impl RunSummary {
    #[must_use]
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// One result per branch, in the order the branches were supplied.
    #[must_use]
    pub fn results(&self) -> &[BranchResult] {
        &self.results
    }

    #[must_use]
    pub fn result(&self, branch_id: &str) -> Option<&BranchResult> {
        self.results
            .iter()
            .find(|r| r.branch_id().as_str() == branch_id)
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        self.health
    }

    #[must_use]
    pub fn into_results(self) -> Vec<BranchResult> {
        self.results
    }
}

/// Live view of a started run. Pull events with [`RunHandle::next_event`].
pub struct RunHandle {
    run_name: String,
    started_at: DateTime<Utc>,
    store: Arc<dyn StateStore>,
    state: RunState,
}

enum RunState {
    Active(ActiveRun),
    Completed(RunSummary),
}

#[derive(Clone, Copy)]
enum ActivePhase {
    Running,
    Draining,
}

struct ActiveRun {
    phase: ActivePhase,
    relay: EventRelay,
    results_rx: mpsc::Receiver<(usize, BranchResult)>,
    slots: Vec<Slot>,
    pending: usize,
}

struct Slot {
    branch_id: BranchId,
    output_key: String,
    result: Option<BranchResult>,
}

impl ActiveRun {
    fn record(&mut self, index: usize, result: BranchResult) {
        if let Some(slot) = self.slots.get_mut(index)
            && slot.result.is_none()
        {
            slot.result = Some(result);
            self.pending = self.pending.saturating_sub(1);
        }
    }

    async fn collect_remaining(&mut self) {
        while self.pending > 0 {
            match self.results_rx.recv().await {
                Some((index, result)) => self.record(index, result),
                None => break,
            }
        }
    }

    /// Final results in branch order. A slot its runner never filled gets a
    /// failed result, which is recorded like any other branch failure.
    fn take_results(&mut self, store: &dyn StateStore) -> Vec<BranchResult> {
        self.slots
            .iter_mut()
            .map(|slot| {
                slot.result.take().unwrap_or_else(|| {
                    tracing::warn!(branch = %slot.branch_id, "branch runner lost; marking failed");
                    let result = BranchResult::failed(
                        slot.branch_id.clone(),
                        slot.output_key.clone(),
                        RUNNER_LOST_MESSAGE,
                        0,
                    );
                    record_branch_error(store, &result);
                    result
                })
            })
            .collect()
    }
}

impl RunHandle {
    #[must_use]
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        match &self.state {
            RunState::Active(active) => match active.phase {
                ActivePhase::Running => RunPhase::Running,
                ActivePhase::Draining => RunPhase::Draining,
            },
            RunState::Completed(_) => RunPhase::Completed,
        }
    }

    /// `Some` once the run has completed.
    #[must_use]
    pub fn summary(&self) -> Option<&RunSummary> {
        match &self.state {
            RunState::Completed(summary) => Some(summary),
            RunState::Active(_) => None,
        }
    }

    /// Next event from any branch.
    ///
    /// Returns `None` exactly when the run has completed: every branch has a
    /// result, every buffered event was delivered, and the health record was
    /// written.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            let RunState::Active(active) = &mut self.state else {
                return None;
            };

            match active.phase {
                ActivePhase::Running => {
                    tokio::select! {
                        biased;
                        event = active.relay.next() => match event {
                            Some(event) => return Some(event),
                            None => {
                                // Every runner has released its relay sender.
                                active.collect_remaining().await;
                                active.phase = ActivePhase::Draining;
                            }
                        },
                        received = active.results_rx.recv() => {
                            match received {
                                Some((index, result)) => active.record(index, result),
                                None => active.pending = 0,
                            }
                            if active.pending == 0 {
                                tracing::debug!(run = %self.run_name, "all branches finished; draining");
                                active.phase = ActivePhase::Draining;
                            }
                        }
                    }
                }
                ActivePhase::Draining => {
                    if let Some(event) = active.relay.next().await {
                        return Some(event);
                    }
                    self.complete();
                    return None;
                }
            }
        }
    }

    /// Drain the run and return its summary.
    pub async fn finish(mut self) -> RunSummary {
        loop {
            match self.state {
                RunState::Completed(summary) => return summary,
                RunState::Active(_) => {
                    self.next_event().await;
                }
            }
        }
    }

    /// Adapt the handle into a [`Stream`] of events.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        stream::unfold(self, |mut handle| async move {
            handle.next_event().await.map(|event| (event, handle))
        })
    }

    fn complete(&mut self) {
        let RunState::Active(active) = &mut self.state else {
            return;
        };
        let results = active.take_results(self.store.as_ref());
        let health = HealthSnapshot::from_results(&results);
        record_health(self.store.as_ref(), &self.run_name, &health);

        tracing::info!(
            run = %self.run_name,
            total = health.total(),
            ok = health.ok_count(),
            failed = health.failed_count(),
            "run completed"
        );

        self.state = RunState::Completed(RunSummary {
            run_name: self.run_name.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            results,
            health,
        });
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_name", &self.run_name)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
