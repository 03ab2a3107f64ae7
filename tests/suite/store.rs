//! Runs persisted through the JSON file store.

use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::tempdir;

use fanout_engine::{
    Branch, JsonFileStore, Orchestrator, ScriptedExecutor, ScriptedFailure, StateStore,
    error_key, health_key,
};

use crate::common::fast_config;

#[tokio::test]
async fn run_results_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("fanout.json");

    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    let branches = vec![
        Branch::new("ok", "ok_out", Arc::new(ScriptedExecutor::succeeding(1))),
        Branch::new(
            "bad",
            "bad_out",
            Arc::new(ScriptedExecutor::succeeding(0).with_failure(ScriptedFailure::Fatal, 1)),
        ),
    ];
    Orchestrator::new(store.clone())
        .with_run_name("persisted")
        .run(branches, fast_config())
        .unwrap()
        .finish()
        .await;
    drop(store);

    let reopened = JsonFileStore::open(&path).unwrap();
    assert_eq!(
        reopened.get(&health_key("persisted")),
        Some(json!({"total": 2, "ok": 1, "failed": 1}))
    );
    assert!(reopened.get(&error_key("bad_out")).is_some());
    assert!(reopened.get(&error_key("ok_out")).is_none());

    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk.as_object().unwrap().len(), 2);
}

#[tokio::test]
async fn later_runs_overwrite_earlier_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    store.set("bad_out__error", json!("stale")).unwrap();

    let branches = vec![Branch::new(
        "bad",
        "bad_out",
        Arc::new(ScriptedExecutor::succeeding(0).with_failure(ScriptedFailure::Fatal, 1)),
    )];
    Orchestrator::new(store.clone())
        .run(branches, fast_config())
        .unwrap()
        .finish()
        .await;

    let error = store.get("bad_out__error").unwrap();
    assert_ne!(error, json!("stale"));
    assert!(error.as_str().unwrap().contains("scripted fatal error"));
}
