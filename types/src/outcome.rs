//! Per-attempt and per-branch outcomes, and the run-level health aggregate.

use serde::{Deserialize, Serialize};

use crate::BranchId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    TransientError,
    FatalError,
    Timeout,
}

/// One try at running a branch. Superseded by the next attempt or by the
/// branch's terminal [`BranchResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    branch_id: BranchId,
    number: u32,
    outcome: AttemptOutcome,
}

impl Attempt {
    /// Start attempt `number` (1-based) in the `Pending` state.
    #[must_use]
    pub fn begin(branch_id: BranchId, number: u32) -> Self {
        debug_assert!(number >= 1, "attempt numbers are 1-based");
        Self {
            branch_id,
            number,
            outcome: AttemptOutcome::Pending,
        }
    }

    pub fn finish(&mut self, outcome: AttemptOutcome) {
        self.outcome = outcome;
    }

    #[must_use]
    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    /// The attempt that follows this one.
    #[must_use]
    pub fn next(&self) -> Self {
        Self::begin(self.branch_id.clone(), self.number + 1)
    }
}

/// Terminal outcome of one branch. Exactly one per branch per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchResult {
    branch_id: BranchId,
    output_key: String,
    ok: bool,
    error: Option<String>,
    attempts: u32,
}

impl BranchResult {
    pub fn succeeded(branch_id: BranchId, output_key: impl Into<String>, attempts: u32) -> Self {
        Self {
            branch_id,
            output_key: output_key.into(),
            ok: true,
            error: None,
            attempts,
        }
    }

    pub fn failed(
        branch_id: BranchId,
        output_key: impl Into<String>,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            branch_id,
            output_key: output_key.into(),
            ok: false,
            error: Some(error.into()),
            attempts,
        }
    }

    #[must_use]
    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    #[must_use]
    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of attempts made, including the final one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Aggregate success/failure counters for one run.
///
/// Invariant: `ok_count + failed_count == total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    total: usize,
    #[serde(rename = "ok")]
    ok_count: usize,
    #[serde(rename = "failed")]
    failed_count: usize,
}

impl HealthSnapshot {
    #[must_use]
    pub fn from_results(results: &[BranchResult]) -> Self {
        let total = results.len();
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        Self {
            total,
            ok_count,
            failed_count: total - ok_count,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn ok_count(&self) -> usize {
        self.ok_count
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed_count
    }

    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.failed_count == 0
    }
}
