//! End-to-end runs through the public orchestrator API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;

use fanout_engine::{
    Branch, MemoryStore, Orchestrator, RunConfig, RunConfigError, RunError, RunPhase,
    ScriptedExecutor, ScriptedFailure, StateStore,
};

use crate::common::{BrokenStore, PanickyStore, Recorder, drain, fast_config, scripted_trace};

#[tokio::test]
async fn mixed_outcomes_scenario() {
    let store = Arc::new(MemoryStore::new());
    let always_down =
        ScriptedExecutor::succeeding(1).with_failure(ScriptedFailure::Transient, u32::MAX);
    let hangs_once = ScriptedExecutor::succeeding(1).with_failure(ScriptedFailure::Timeout, 1);

    let branches = vec![
        Branch::new("a", "a_out", Arc::new(always_down.clone())),
        Branch::new("b", "b_out", Arc::new(ScriptedExecutor::succeeding(1))),
        Branch::new("c", "c_out", Arc::new(hangs_once.clone())),
    ];
    let config = fast_config()
        .with_max_retries(2)
        .with_timeout(Some(Duration::from_millis(100)));

    let handle = Orchestrator::new(store.clone())
        .with_run_name("mixed")
        .run(branches, config)
        .unwrap();
    let (_events, summary) = drain(handle).await;

    let snapshot = summary.snapshot();
    assert_eq!(
        (snapshot.total(), snapshot.ok_count(), snapshot.failed_count()),
        (3, 2, 1)
    );

    let a = summary.result("a").unwrap();
    assert!(!a.is_ok());
    assert_eq!(a.attempts(), 3);
    assert_eq!(always_down.calls(), 3);
    assert!(a.error().unwrap().contains("gave up after 3 attempts"));

    let c = summary.result("c").unwrap();
    assert!(c.is_ok());
    assert_eq!(c.attempts(), 2);
    assert_eq!(hangs_once.calls(), 2);

    assert_eq!(
        store.keys(),
        vec![
            "__parallel_health__:mixed".to_string(),
            "a_out__error".to_string(),
        ]
    );
    assert_eq!(
        store.get("__parallel_health__:mixed"),
        Some(json!({"total": 3, "ok": 2, "failed": 1}))
    );
}

#[tokio::test]
async fn concurrency_never_exceeds_limit() {
    let recorder = Recorder::new();
    let branches: Vec<_> = (0..8)
        .map(|i| {
            Branch::new(
                format!("b{i}"),
                format!("b{i}_out"),
                recorder.executor(Duration::from_millis(25)),
            )
        })
        .collect();

    let handle = Orchestrator::new(Arc::new(MemoryStore::new()))
        .run(branches, fast_config().with_max_concurrency(3))
        .unwrap();
    let (_events, summary) = drain(handle).await;

    assert!(summary.snapshot().all_ok());
    assert!(recorder.peak() <= 3, "peak concurrency {}", recorder.peak());
    assert!(recorder.peak() >= 2, "branches should overlap at all");
}

#[tokio::test]
async fn single_slot_runs_branches_sequentially() {
    let recorder = Recorder::new();
    let branches: Vec<_> = ["x", "y", "z"]
        .into_iter()
        .map(|id| Branch::new(id, format!("{id}_out"), recorder.executor(Duration::from_millis(20))))
        .collect();

    let handle = Orchestrator::new(Arc::new(MemoryStore::new()))
        .run(branches, fast_config().with_max_concurrency(1))
        .unwrap();
    drain(handle).await;

    let spans = recorder.spans();
    assert_eq!(spans.len(), 3);
    for pair in spans.windows(2) {
        assert!(
            pair[1].start >= pair[0].end,
            "{} started before {} finished",
            pair[1].branch,
            pair[0].branch
        );
    }
    assert_eq!(recorder.peak(), 1);
}

#[tokio::test]
async fn fatal_error_is_attempted_once() {
    let store = Arc::new(MemoryStore::new());
    let fatal = ScriptedExecutor::succeeding(0).with_failure(ScriptedFailure::Fatal, u32::MAX);

    let handle = Orchestrator::new(store.clone())
        .run(
            vec![Branch::new("f", "f_out", Arc::new(fatal.clone()))],
            fast_config().with_max_retries(5),
        )
        .unwrap();
    let summary = handle.finish().await;

    let result = summary.result("f").unwrap();
    assert_eq!(result.attempts(), 1);
    assert_eq!(fatal.calls(), 1);
    assert!(!result.error().unwrap().contains("gave up"));
    assert!(store.get("f_out__error").is_some());
}

#[tokio::test]
async fn transient_failures_retry_exactly_max_retries_times() {
    for max_retries in [0, 1, 4] {
        let flaky =
            ScriptedExecutor::succeeding(0).with_failure(ScriptedFailure::Transient, u32::MAX);
        let summary = Orchestrator::new(Arc::new(MemoryStore::new()))
            .run(
                vec![Branch::new("t", "t_out", Arc::new(flaky.clone()))],
                fast_config().with_max_retries(max_retries),
            )
            .unwrap()
            .finish()
            .await;

        assert_eq!(flaky.calls(), max_retries + 1);
        assert_eq!(summary.result("t").unwrap().attempts(), max_retries + 1);
    }
}

#[tokio::test]
async fn timeout_keeps_events_emitted_before_deadline() {
    let executor = ScriptedExecutor::succeeding(2).with_failure(ScriptedFailure::Timeout, 1);
    let handle = Orchestrator::new(Arc::new(MemoryStore::new()))
        .run(
            vec![Branch::new("slow", "slow_out", Arc::new(executor))],
            fast_config().with_timeout(Some(Duration::from_millis(80))),
        )
        .unwrap();
    let (events, summary) = drain(handle).await;

    assert!(summary.result("slow").unwrap().is_ok());
    assert_eq!(
        scripted_trace(&events, "slow"),
        vec![(1, 0), (1, 1), (2, 0), (2, 1)]
    );
}

#[tokio::test]
async fn panicking_branch_does_not_affect_siblings() {
    let store = Arc::new(MemoryStore::new());
    let branches = vec![
        Branch::new(
            "boom",
            "boom_out",
            Arc::new(ScriptedExecutor::succeeding(1).with_failure(ScriptedFailure::Panic, 1)),
        ),
        Branch::new("ok1", "ok1_out", Arc::new(ScriptedExecutor::succeeding(3))),
        Branch::new("ok2", "ok2_out", Arc::new(ScriptedExecutor::succeeding(3))),
    ];

    let handle = Orchestrator::new(store.clone())
        .run(branches, fast_config())
        .unwrap();
    let (events, summary) = drain(handle).await;

    let boom = summary.result("boom").unwrap();
    assert!(!boom.is_ok());
    assert_eq!(boom.attempts(), 1);
    assert!(boom.error().unwrap().contains("panicked"), "{:?}", boom.error());

    assert_eq!(scripted_trace(&events, "ok1").len(), 3);
    assert_eq!(scripted_trace(&events, "ok2").len(), 3);
    assert_eq!(summary.snapshot().ok_count(), 2);
    assert!(store.get("boom_out__error").is_some());
}

#[tokio::test]
async fn events_keep_per_branch_order_under_backpressure() {
    let branches: Vec<_> = ["p", "q", "r"]
        .into_iter()
        .map(|id| {
            let exec = ScriptedExecutor::succeeding(20).with_interval(Duration::from_millis(1));
            Branch::new(id, format!("{id}_out"), Arc::new(exec))
        })
        .collect();

    let mut handle = Orchestrator::new(Arc::new(MemoryStore::new()))
        .run(branches, fast_config().with_event_buffer(1))
        .unwrap();

    let mut by_branch: HashMap<String, Vec<u64>> = HashMap::new();
    while let Some(event) = handle.next_event().await {
        // Slow consumer.
        tokio::time::sleep(Duration::from_millis(1)).await;
        by_branch
            .entry(event.source().to_string())
            .or_default()
            .push(event.payload()["seq"].as_u64().unwrap());
    }

    let expected: Vec<u64> = (0..20).collect();
    for id in ["p", "q", "r"] {
        assert_eq!(by_branch[id], expected, "branch {id}");
    }
}

#[tokio::test]
async fn reruns_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let flaky = ScriptedExecutor::succeeding(2).with_failure(ScriptedFailure::Transient, 1);
    let branches = vec![
        Branch::new("one", "one_out", Arc::new(flaky.clone())),
        Branch::new("two", "two_out", Arc::new(ScriptedExecutor::succeeding(1))),
    ];

    let first = Orchestrator::new(store.clone())
        .with_run_name("first")
        .run(branches.clone(), fast_config())
        .unwrap();
    let (first_events, first_summary) = drain(first).await;

    let second = Orchestrator::new(store.clone())
        .with_run_name("second")
        .run(branches, fast_config())
        .unwrap();
    let (second_events, second_summary) = drain(second).await;

    // The shared executor saw both runs' attempts; nothing else carried over.
    assert_eq!(flaky.calls(), 4);
    assert_eq!(first_summary.results(), second_summary.results());
    assert_eq!(first_events.len(), second_events.len());
    assert_eq!(
        store.get("__parallel_health__:first"),
        store.get("__parallel_health__:second")
    );
}

#[tokio::test]
async fn invalid_config_is_rejected_before_any_branch_starts() {
    let executor = ScriptedExecutor::succeeding(1);
    let result = Orchestrator::new(Arc::new(MemoryStore::new())).run(
        vec![Branch::new("a", "a_out", Arc::new(executor.clone()))],
        RunConfig::default().with_max_concurrency(0),
    );

    assert!(matches!(
        result,
        Err(RunError::InvalidConfig(RunConfigError::ZeroConcurrency))
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let result = Orchestrator::new(Arc::new(MemoryStore::new())).run(
        vec![
            Branch::new("same", "x", Arc::new(ScriptedExecutor::succeeding(0))),
            Branch::new("same", "y", Arc::new(ScriptedExecutor::succeeding(0))),
        ],
        RunConfig::default(),
    );
    assert!(matches!(result, Err(RunError::DuplicateBranchId(_))));
}

#[tokio::test]
async fn partial_consumption_skips_health_but_branches_finish() {
    let store = Arc::new(MemoryStore::new());
    let failing = ScriptedExecutor::succeeding(5)
        .with_interval(Duration::from_millis(2))
        .with_failure(ScriptedFailure::Fatal, u32::MAX);

    let mut handle = Orchestrator::new(store.clone())
        .with_run_name("partial")
        .run(
            vec![Branch::new("f", "f_out", Arc::new(failing.clone()))],
            fast_config(),
        )
        .unwrap();
    assert!(handle.next_event().await.is_some());
    assert_eq!(handle.phase(), RunPhase::Running);
    drop(handle);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failing.calls(), 1);
    assert!(store.get("f_out__error").is_some());
    assert!(store.get("__parallel_health__:partial").is_none());
}

#[tokio::test]
async fn store_failures_do_not_fail_the_run() {
    let store: Arc<dyn StateStore> = Arc::new(BrokenStore);
    let branches = vec![
        Branch::new(
            "bad",
            "bad_out",
            Arc::new(ScriptedExecutor::succeeding(0).with_failure(ScriptedFailure::Fatal, 1)),
        ),
        Branch::new("good", "good_out", Arc::new(ScriptedExecutor::succeeding(1))),
    ];

    let summary = Orchestrator::new(store)
        .run(branches, fast_config())
        .unwrap()
        .finish()
        .await;

    let snapshot = summary.snapshot();
    assert_eq!(snapshot.total(), 2);
    assert_eq!(snapshot.failed_count(), 1);
}

#[tokio::test]
async fn stream_adapter_yields_every_event() {
    let branches: Vec<_> = (0..4)
        .map(|i| {
            Branch::new(
                format!("s{i}"),
                format!("s{i}_out"),
                Arc::new(ScriptedExecutor::succeeding(5)),
            )
        })
        .collect();

    let store = Arc::new(MemoryStore::new());
    let events: Vec<_> = Orchestrator::new(store.clone())
        .with_run_name("streamed")
        .run(branches, fast_config())
        .unwrap()
        .into_stream()
        .collect()
        .await;

    assert_eq!(events.len(), 20);
    assert_eq!(
        store.get("__parallel_health__:streamed"),
        Some(json!({"total": 4, "ok": 4, "failed": 0}))
    );
}

#[tokio::test]
async fn results_follow_branch_order() {
    let branches: Vec<_> = (0..5)
        .rev()
        .map(|i| {
            let exec = ScriptedExecutor::succeeding(1).with_interval(Duration::from_millis(i * 5));
            Branch::new(format!("o{i}"), format!("o{i}_out"), Arc::new(exec))
        })
        .collect();

    let summary = Orchestrator::new(Arc::new(MemoryStore::new()))
        .run(branches, fast_config())
        .unwrap()
        .finish()
        .await;

    let ids: Vec<_> = summary
        .results()
        .iter()
        .map(|r| r.branch_id().to_string())
        .collect();
    assert_eq!(ids, ["o4", "o3", "o2", "o1", "o0"]);
}

#[tokio::test]
async fn retrying_branch_keeps_its_slot_through_backoff() {
    let recorder = Recorder::new();
    let flaky = ScriptedExecutor::succeeding(0).with_failure(ScriptedFailure::Transient, 2);
    let branches = vec![
        Branch::new("flaky", "flaky_out", Arc::new(flaky.clone())),
        Branch::new("waiter", "waiter_out", recorder.executor(Duration::from_millis(5))),
    ];
    // Backoffs of 50ms then 100ms.
    let config = RunConfig::default()
        .with_max_concurrency(1)
        .with_max_retries(3)
        .with_delays(Duration::from_millis(50), Duration::from_secs(1))
        .with_jitter(0.0);

    let launched = tokio::time::Instant::now();
    let handle = Orchestrator::new(Arc::new(MemoryStore::new()))
        .run(branches, config)
        .unwrap();
    let (_events, summary) = drain(handle).await;

    assert_eq!(summary.snapshot().ok_count(), 2);
    assert_eq!(flaky.calls(), 3);
    let spans = recorder.spans();
    assert_eq!(spans.len(), 1);
    let waited = spans[0].start.duration_since(launched);
    assert!(
        waited >= Duration::from_millis(140),
        "waiter started after {waited:?}, before the flaky branch finished backing off"
    );
}

#[tokio::test]
async fn lost_runner_is_reported_as_failed() {
    let store = Arc::new(PanickyStore::new());
    let branches = vec![
        Branch::new("ok", "ok_out", Arc::new(ScriptedExecutor::succeeding(1))),
        Branch::new(
            "bad",
            "bad_out",
            Arc::new(ScriptedExecutor::succeeding(0).with_failure(ScriptedFailure::Fatal, 1)),
        ),
    ];

    let summary = Orchestrator::new(store.clone())
        .with_run_name("lost")
        .run(branches, fast_config())
        .unwrap()
        .finish()
        .await;

    let snapshot = summary.snapshot();
    assert_eq!(snapshot.total(), 2);
    assert_eq!(snapshot.ok_count() + snapshot.failed_count(), snapshot.total());
    assert_eq!(snapshot.failed_count(), 1);

    let lost = summary.result("bad").unwrap();
    assert_eq!(lost.attempts(), 0);
    assert_eq!(lost.error(), Some("branch runner terminated unexpectedly"));
    assert_eq!(
        store.get("bad_out__error"),
        Some(json!("branch runner terminated unexpectedly"))
    );
    assert_eq!(
        store.get("__parallel_health__:lost"),
        Some(json!({"total": 2, "ok": 1, "failed": 1}))
    );
}

#[tokio::test]
async fn oversized_timeout_does_not_fail_branches() {
    let config = fast_config().with_timeout(Some(Duration::from_secs(u64::MAX / 2)));
    let branches = vec![
        Branch::new("a", "a_out", Arc::new(ScriptedExecutor::succeeding(1))),
        Branch::new("b", "b_out", Arc::new(ScriptedExecutor::succeeding(2))),
    ];

    let (events, summary) = drain(
        Orchestrator::new(Arc::new(MemoryStore::new()))
            .run(branches, config)
            .unwrap(),
    )
    .await;

    assert_eq!(events.len(), 3);
    assert!(summary.snapshot().all_ok());
    assert!(summary.results().iter().all(|r| r.attempts() == 1));
}
