//! fanout CLI - run a scenario of scripted branches and stream their events.
//!
//! ```text
//! fanout [--config PATH] SCENARIO.toml
//! ```
//!
//! Events are printed to stdout as JSON lines while the run progresses,
//! followed by one `{"summary": ...}` line. Logs never go to stdout.
//!
//! Exit codes: `0` every branch succeeded, `2` at least one branch failed,
//! `130` interrupted.

mod scenario;

use std::fs::{self, OpenOptions};
use std::io::{Write, stdout};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use fanout_config::{Settings, config_path};
use fanout_engine::{JsonFileStore, MemoryStore, Orchestrator, RunHandle, StateStore};

use scenario::Scenario;

const USAGE: &str = "usage: fanout [--config PATH] SCENARIO.toml";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_fanout_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout carries the event stream.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_fanout_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in fanout_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn fanout_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.fanout/logs/fanout.log
    if let Some(config_path) = config_path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("fanout.log"));
    }

    // Fallback: ./.fanout/logs/fanout.log
    candidates.push(PathBuf::from(".fanout").join("logs").join("fanout.log"));

    candidates
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    scenario: PathBuf,
}

enum Command {
    Run(Args),
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command> {
    let mut config = None;
    let mut scenario = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-c" | "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config requires a path\n{USAGE}");
                };
                config = Some(PathBuf::from(path));
            }
            other if other.starts_with('-') => bail!("unknown option {other}\n{USAGE}"),
            other => {
                if scenario.is_some() {
                    bail!("unexpected argument {other}\n{USAGE}");
                }
                scenario = Some(PathBuf::from(other));
            }
        }
    }

    let Some(scenario) = scenario else {
        bail!("missing scenario file\n{USAGE}");
    };
    Ok(Command::Run(Args { config, scenario }))
}

fn open_store(settings: &Settings) -> Result<Arc<dyn StateStore>> {
    match settings.store_path() {
        Some(path) => {
            let store = JsonFileStore::open(path)
                .with_context(|| format!("failed to open state store {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Print every event, then the summary. Returns whether every branch succeeded.
async fn stream_run(mut handle: RunHandle) -> Result<bool> {
    let mut out = stdout();
    while let Some(event) = handle.next_event().await {
        serde_json::to_writer(&mut out, &event)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }

    let summary = handle.finish().await;
    serde_json::to_writer(&mut out, &serde_json::json!({ "summary": &summary }))?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(summary.snapshot().all_ok())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let args = match parse_args(std::env::args().skip(1))? {
        Command::Help => {
            println!("{USAGE}");
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run(args) => args,
    };

    let settings = Settings::load(args.config.as_deref())?;
    let scenario = Scenario::load(&args.scenario)?;
    scenario.check_against(settings.run())?;
    let store = open_store(&settings)?;

    let mut orchestrator = Orchestrator::new(store).with_context(scenario.context()?);
    if let Some(name) = scenario.name() {
        orchestrator = orchestrator.with_run_name(name);
    }
    let handle = orchestrator.run(scenario.branches(), settings.into_run())?;

    tokio::select! {
        outcome = stream_run(handle) => {
            if outcome? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; run abandoned before completion");
            Ok(ExitCode::from(130))
        }
    }
}
