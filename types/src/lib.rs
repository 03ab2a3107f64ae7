//! Core domain types for fanout.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the orchestrator.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod error;
mod ids;
mod outcome;
mod settings;

pub use error::{BranchError, ErrorKind, TransientCause};
pub use ids::BranchId;
pub use outcome::{Attempt, AttemptOutcome, BranchResult, HealthSnapshot};
pub use settings::{
    DEFAULT_BASE_DELAY, DEFAULT_EVENT_BUFFER, DEFAULT_JITTER, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, RunConfig, RunConfigError,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Branch Events
// ============================================================================

/// One opaque event produced by a branch executor.
///
/// The orchestrator stamps the source branch and attempt number and otherwise
/// forwards the payload untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    source: BranchId,
    attempt: u32,
    payload: serde_json::Value,
}

impl Event {
    #[must_use]
    pub fn new(source: BranchId, attempt: u32, payload: serde_json::Value) -> Self {
        Self {
            source,
            attempt,
            payload,
        }
    }

    #[must_use]
    pub fn source(&self) -> &BranchId {
        &self.source
    }

    /// 1-based attempt that produced this event.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}
