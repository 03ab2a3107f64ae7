//! Parallel branch orchestration with retries, timeouts, and fan-in streaming.
//!
//! # Architecture
//!
//! - [`Orchestrator`] - validates a run, spawns one runner task per branch, and
//!   hands back a [`RunHandle`]
//! - [`ConcurrencyGate`] - bounds how many branches execute at once
//! - [`retry`] - pure retry decision with exponential backoff and jitter
//! - [`EventRelay`] - merges per-branch bounded queues into one stream
//! - [`StateStore`] - key/value sink for per-branch errors and run health
//!
//! Each attempt of a branch runs its [`BranchExecutor`] in a separate task that
//! feeds a bounded queue. The runner forwards queued events to the relay, races
//! them against the run timeout, and retries the branch from scratch when the
//! [`retry`] policy allows it.
//!
//! # Failure isolation
//!
//! Executor errors, panics, and timeouts are folded into a [`BranchResult`].
//! Nothing a branch does can fail the run; the only run-level errors are the
//! synchronous admission checks in [`RunError`].
//!
//! # Store keys
//!
//! | Key | Written when | Value |
//! |-----|--------------|-------|
//! | `{output_key}__error` | a branch fails | error message |
//! | `__parallel_health__:{run_name}` | the run completes | `{"total", "ok", "failed"}` |

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod executor;
mod gate;
mod orchestrator;
mod relay;
pub mod retry;
mod runner;
mod scripted;
mod store;

pub use executor::{Branch, BranchExecutor, ExecCtx, ExecFut};
pub use gate::{ConcurrencyGate, GateClosed, GatePermit};
pub use orchestrator::{Orchestrator, RunError, RunHandle, RunPhase, RunSummary};
pub use relay::{EventRelay, RelaySender};
pub use retry::{RetryDecision, decide};
pub use scripted::{ScriptedExecutor, ScriptedFailure};
pub use store::{
    ERROR_KEY_SUFFIX, HEALTH_KEY_PREFIX, JsonFileStore, MemoryStore, StateStore, StoreError,
    error_key, health_key,
};

pub use fanout_types::{
    Attempt, AttemptOutcome, BranchError, BranchId, BranchResult, ErrorKind, Event,
    HealthSnapshot, RunConfig, RunConfigError, TransientCause,
};
