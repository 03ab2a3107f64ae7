//! Scenario files: a list of scripted branches to run.
//!
//! ```toml
//! name = "nightly"              # optional run name
//!
//! [context]                     # optional, handed to every branch
//! prompt = "summarize the video"
//!
//! [[branch]]
//! id = "summary"
//! output_key = "summary_out"    # defaults to the id
//! events = 3
//! event_interval_ms = 50
//! failure = "transient"         # transient | fatal | timeout | panic
//! fail_attempts = 2
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use fanout_engine::{Branch, RunConfig, ScriptedExecutor, ScriptedFailure};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Scenario {
    name: Option<String>,
    context: Option<toml::Table>,
    #[serde(default, rename = "branch")]
    branches: Vec<BranchSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BranchSpec {
    id: String,
    output_key: Option<String>,
    #[serde(default)]
    events: u32,
    #[serde(default)]
    event_interval_ms: u64,
    failure: Option<ScriptedFailure>,
    fail_attempts: Option<u32>,
}

impl Scenario {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        if scenario.branches.is_empty() {
            bail!("scenario declares no [[branch]] tables");
        }
        Ok(scenario)
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn context(&self) -> Result<serde_json::Value> {
        match &self.context {
            Some(table) => Ok(serde_json::to_value(table)?),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Reject scripted hangs that no configured timeout would ever end.
    pub(crate) fn check_against(&self, run: &RunConfig) -> Result<()> {
        if run.timeout().is_some() {
            return Ok(());
        }
        if let Some(branch) = self
            .branches
            .iter()
            .find(|b| b.failure == Some(ScriptedFailure::Timeout))
        {
            bail!(
                "branch {} scripts a timeout but no run.timeout_secs is configured; it would never finish",
                branch.id
            );
        }
        Ok(())
    }

    pub(crate) fn branches(&self) -> Vec<Branch> {
        self.branches.iter().map(BranchSpec::to_branch).collect()
    }
}

impl BranchSpec {
    fn to_branch(&self) -> Branch {
        let mut executor = ScriptedExecutor::succeeding(self.events)
            .with_interval(Duration::from_millis(self.event_interval_ms));
        if let Some(failure) = self.failure {
            // A failure with no count fails every attempt.
            executor = executor.with_failure(failure, self.fail_attempts.unwrap_or(u32::MAX));
        }
        let output_key = self.output_key.clone().unwrap_or_else(|| self.id.clone());
        Branch::new(self.id.as_str(), output_key, Arc::new(executor))
    }
}
