//! Tests for dispatch outcomes, isolation, and engine-unavailable revert.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use sluice_admission::{CloseReason, ClosedBatch, EventKind, InboundEvent, SizedEvent};
use sluice_store::{RecordStatus, StateStore};
use tempfile::tempdir;
use tokio::time::sleep;

use super::*;

#[derive(Clone)]
enum Script {
    Succeed(f64),
    Fail(&'static str),
    Unavailable(&'static str),
    Hang,
}

struct ScriptedEngine {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(id, script)| (id.to_string(), script))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn execute(&self, event: &SizedEvent) -> Result<EngineReport, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .expect("script lock")
            .get(&event.event.id)
            .cloned()
            .unwrap_or(Script::Succeed(0.1));
        match script {
            Script::Succeed(cost) => Ok(EngineReport {
                cost,
                tokens_used: 42,
            }),
            Script::Fail(reason) => Err(EngineError::Failed {
                reason: reason.to_string(),
            }),
            Script::Unavailable(reason) => Err(EngineError::Unavailable {
                reason: reason.to_string(),
            }),
            Script::Hang => {
                sleep(Duration::from_secs(30)).await;
                Ok(EngineReport {
                    cost: 0.0,
                    tokens_used: 0,
                })
            }
        }
    }
}

fn sized(id: &str) -> SizedEvent {
    SizedEvent {
        event: InboundEvent {
            id: id.to_string(),
            kind: EventKind::Issue,
            action: "opened".to_string(),
            subject_id: "issue-1".to_string(),
            payload_summary: "dispatch me".to_string(),
            received_at_unix_ms: 1_000,
        },
        token_estimate: 64,
    }
}

fn batch_of(store: &StateStore, ids: &[&str]) -> ClosedBatch {
    let events: Vec<SizedEvent> = ids.iter().map(|id| sized(id)).collect();
    for event in &events {
        store.insert_if_absent(&event.to_stored()).expect("insert");
    }
    ClosedBatch {
        batch_id: "issue-batch-0".to_string(),
        kind: EventKind::Issue,
        opened_at_unix_ms: 1_000,
        close_reason: CloseReason::BatchFull,
        events,
    }
}

#[tokio::test]
async fn functional_completed_batch_records_costs() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let engine = ScriptedEngine::new([("e-1", Script::Succeed(0.5)), ("e-2", Script::Succeed(0.25))]);
    let dispatcher = Dispatcher::new(Arc::clone(&store), engine, 0);

    let report = dispatcher
        .dispatch(batch_of(&store, &["e-1", "e-2"]))
        .await
        .expect("dispatch");
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(store.total_spend().expect("spend"), 0.75);

    for id in ["e-1", "e-2"] {
        let record = store.get(id).expect("get").expect("record");
        assert_eq!(record.status, RecordStatus::Completed);
        assert!(record.realized_cost.is_some());
    }
}

#[tokio::test]
async fn functional_partial_batch_failure_is_isolated() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let engine = ScriptedEngine::new([("e-3", Script::Fail("task_failed"))]);
    let dispatcher = Dispatcher::new(Arc::clone(&store), engine, 0);

    let report = dispatcher
        .dispatch(batch_of(&store, &["e-1", "e-2", "e-3", "e-4", "e-5"]))
        .await
        .expect("dispatch");
    assert_eq!(report.completed, 4);
    assert_eq!(report.failed, 1);

    let record = store.get("e-3").expect("get").expect("record");
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("task_failed"));
    for id in ["e-1", "e-2", "e-4", "e-5"] {
        assert_eq!(
            store.get(id).expect("get").expect("record").status,
            RecordStatus::Completed
        );
    }
}

#[tokio::test]
async fn functional_unavailable_engine_reverts_unreached_events() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let engine = ScriptedEngine::new([("e-2", Script::Unavailable("backend unreachable"))]);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&engine) as Arc<dyn ExecutionEngine>,
        0,
    );

    let error = dispatcher
        .dispatch(batch_of(&store, &["e-1", "e-2", "e-3"]))
        .await
        .expect_err("must propagate as transient failure");
    match error {
        DispatchError::EngineUnavailable { reverted, .. } => assert_eq!(reverted, 2),
        other => panic!("unexpected error {other:?}"),
    }

    // The completed sibling keeps its outcome; nothing ran for the rest.
    assert_eq!(
        store.get("e-1").expect("get").expect("record").status,
        RecordStatus::Completed
    );
    for id in ["e-2", "e-3"] {
        assert_eq!(
            store.get(id).expect("get").expect("record").status,
            RecordStatus::Pending
        );
    }
    assert_eq!(engine.calls(), 2);
}

#[tokio::test]
async fn functional_timeout_fails_one_event_not_the_batch() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let engine = ScriptedEngine::new([("e-1", Script::Hang)]);
    let dispatcher = Dispatcher::new(Arc::clone(&store), engine, 50);

    let report = dispatcher
        .dispatch(batch_of(&store, &["e-1", "e-2"]))
        .await
        .expect("dispatch");
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);

    let record = store.get("e-1").expect("get").expect("record");
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("engine_timeout"));
    assert_eq!(
        store.get("e-2").expect("get").expect("record").status,
        RecordStatus::Completed
    );
}

#[tokio::test]
async fn regression_unclaimed_events_are_never_executed() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let engine = ScriptedEngine::new([]);
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&engine) as Arc<dyn ExecutionEngine>, 0);

    let batch = batch_of(&store, &["e-1", "e-2"]);
    // Another dispatcher already finished e-1.
    store
        .claim_in_flight(&["e-1".to_string()], 1_500)
        .expect("claim");
    store.mark_completed("e-1", 0.9, 7, 1_600).expect("complete");

    let report = dispatcher.dispatch(batch).await.expect("dispatch");
    assert_eq!(report.completed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(engine.calls(), 1);
    assert_eq!(store.total_spend().expect("spend"), 1.0);
}
