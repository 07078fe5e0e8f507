//! Tests for normalization, config defaults, and both runtime modes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use sluice_admission::{AdmissionController, EventKind, InboundEvent, SizedEvent};
use sluice_dispatch::{Dispatcher, EngineError, EngineReport, ExecutionEngine};
use sluice_store::{RecordStatus, StateStore};
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use super::*;

struct StaticEngine;

#[async_trait]
impl ExecutionEngine for StaticEngine {
    async fn execute(&self, event: &SizedEvent) -> Result<EngineReport, EngineError> {
        Ok(EngineReport {
            cost: 0.5,
            tokens_used: event.token_estimate,
        })
    }
}

fn raw_issue_payload() -> serde_json::Value {
    json!({
        "event_name": "issues",
        "action": "opened",
        "issue": {
            "number": 42,
            "title": "Login test is flaky",
            "body": "It fails roughly one run in five.",
            "created_at": "2026-01-01T00:00:01Z"
        }
    })
}

#[test]
fn unit_normalize_raw_issue_payload_uses_stable_ids() {
    let event = normalize_payload(&raw_issue_payload(), 99).expect("normalize");
    assert_eq!(event.id, "issues-42");
    assert_eq!(event.kind, EventKind::Issue);
    assert_eq!(event.action, "opened");
    assert_eq!(event.subject_id, "issue-42");
    assert!(event.payload_summary.starts_with("Login test is flaky"));
    assert_eq!(
        Some(event.received_at_unix_ms),
        parse_rfc3339_to_unix_ms("2026-01-01T00:00:01Z")
    );
}

#[test]
fn unit_normalize_accepts_pre_normalized_payloads() {
    let payload = json!({
        "id": "delivery-afc1",
        "type": "pull_request",
        "action": "synchronize",
        "subject_id": "pull_request-7",
        "payload_summary": "sync",
        "received_at": 12_345
    });
    let event = normalize_payload(&payload, 99).expect("normalize");
    assert_eq!(event.id, "delivery-afc1");
    assert_eq!(event.kind, EventKind::PullRequest);
    assert_eq!(event.received_at_unix_ms, 12_345);
}

#[test]
fn unit_normalize_rejects_unknown_event_name() {
    let payload = json!({"event_name": "workflow_run", "action": "completed"});
    assert!(normalize_payload(&payload, 99).is_err());
}

#[test]
fn unit_normalize_hashes_payloads_without_subject_number() {
    let payload = json!({"event_name": "discussion", "action": "created", "discussion": {}});
    let event = normalize_payload(&payload, 99).expect("normalize");
    assert!(event.id.starts_with("discussion-"));
    assert_eq!(event.id.len(), "discussion-".len() + 16);
    assert_eq!(event.received_at_unix_ms, 99);
}

#[test]
fn functional_config_defaults_cover_partial_toml() {
    let config: SluiceConfig = toml::from_str(
        r#"
        [limits]
        max_hourly_rate = 20.0

        [kinds.issue]
        actions = ["opened"]
        batch_size = 3
        min_tokens = 32
        max_tokens = 4096
        batch_token_budget = 8192
        "#,
    )
    .expect("parse");

    assert_eq!(config.limits.max_hourly_rate, 20.0);
    assert_eq!(config.limits.target_hourly_rate, 10.0);
    assert_eq!(config.rate_limiter.requests_per_hour, 100);
    assert_eq!(config.retention.horizon_days, 30);
    assert_eq!(config.kinds.issue.batch_size, 3);
    // Untouched kinds keep their defaults.
    assert_eq!(config.kinds.pull_request.batch_size, 5);

    let settings = config.admission_settings();
    assert_eq!(settings.flush_interval_ms, 30_000);
}

#[tokio::test]
async fn functional_action_run_completes_single_event() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let config = SluiceConfig::default();
    let controller = AdmissionController::new(Arc::clone(&store), config.admission_settings());
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(StaticEngine), 0);

    let payload_path = dir.path().join("event.json");
    std::fs::write(&payload_path, raw_issue_payload().to_string()).expect("write payload");

    let report = run_action(&store, &controller, &dispatcher, &payload_path, 64)
        .await
        .expect("action run");
    assert_eq!(report.admission.outcome, "admitted");
    assert_eq!(report.dispatches.len(), 1);
    assert_eq!(report.dispatches[0].completed, 1);

    let record = store.get("issues-42").expect("get").expect("record");
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.realized_cost, Some(0.5));
    assert_eq!(store.total_spend().expect("spend"), 0.5);
}

#[tokio::test]
async fn functional_action_rerun_absorbs_duplicate_delivery() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let config = SluiceConfig::default();
    let controller = AdmissionController::new(Arc::clone(&store), config.admission_settings());
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(StaticEngine), 0);

    let payload_path = dir.path().join("event.json");
    std::fs::write(&payload_path, raw_issue_payload().to_string()).expect("write payload");

    run_action(&store, &controller, &dispatcher, &payload_path, 64)
        .await
        .expect("first run");
    let report = run_action(&store, &controller, &dispatcher, &payload_path, 64)
        .await
        .expect("second run");
    assert_eq!(report.admission.outcome, "duplicate");
    assert!(report.dispatches.is_empty());
    assert_eq!(store.total_spend().expect("spend"), 0.5);
}

#[tokio::test]
async fn integration_bot_loop_flushes_and_dispatches() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(StateStore::open(dir.path().join("state.sqlite")).expect("open"));
    let mut config = SluiceConfig::default();
    config.batching.flush_interval_ms = 20;
    let controller = Arc::new(AdmissionController::new(
        Arc::clone(&store),
        config.admission_settings(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), Arc::new(StaticEngine), 0));
    let runtime = Arc::new(BotRuntime::new(
        Arc::clone(&store),
        controller,
        dispatcher,
        BotRuntimeConfig {
            tick_interval_ms: 10,
            retention_sweep_every_ticks: 0,
            retention_horizon_ms: config.retention_horizon_ms(),
            pending_sweep_limit: 64,
            engine_backoff_ms: 50,
            deferred_alert_age_ms: 60_000,
            status_path: Some(dir.path().join("status.json")),
        },
    ));

    let (sender, receiver) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.run(receiver, shutdown_rx).await })
    };

    sender
        .send(InboundEvent {
            id: "issues-9000".to_string(),
            kind: EventKind::Issue,
            action: "opened".to_string(),
            subject_id: "issue-9000".to_string(),
            payload_summary: "a live delivery".to_string(),
            received_at_unix_ms: 1_000,
        })
        .await
        .expect("send");

    let mut completed = false;
    for _ in 0..100 {
        sleep(Duration::from_millis(20)).await;
        if let Some(record) = store.get("issues-9000").expect("get") {
            if record.status == RecordStatus::Completed {
                completed = true;
                break;
            }
        }
    }
    assert!(completed, "bot loop should flush and dispatch the delivery");

    // The tick also exports the observability snapshot for external readers.
    let status_path = dir.path().join("status.json");
    assert!(status_path.exists());
    let raw = std::fs::read_to_string(&status_path).expect("read status");
    let snapshot: serde_json::Value = serde_json::from_str(&raw).expect("parse status");
    assert!(snapshot.get("hourly_rate").is_some());

    shutdown_tx.send(true).expect("shutdown");
    run_handle.await.expect("join").expect("run");
}

#[test]
fn functional_status_snapshot_reflects_store_state() {
    let dir = tempdir().expect("tempdir");
    let store = StateStore::open(dir.path().join("state.sqlite")).expect("open");

    let pending = sluice_store::StoredEvent {
        event_id: "issues-1".to_string(),
        event_kind: "issue".to_string(),
        action: "opened".to_string(),
        subject_id: "issue-1".to_string(),
        token_estimate: 64,
        payload_summary: "waiting".to_string(),
        received_at_unix_ms: 1_000,
    };
    let done = sluice_store::StoredEvent {
        event_id: "issues-2".to_string(),
        event_kind: "issue".to_string(),
        action: "opened".to_string(),
        subject_id: "issue-2".to_string(),
        token_estimate: 64,
        payload_summary: "done".to_string(),
        received_at_unix_ms: 1_000,
    };
    store.insert_if_absent(&pending).expect("insert");
    store.insert_if_absent(&done).expect("insert");
    store.claim_in_flight(&["issues-2".to_string()], 2_000).expect("claim");
    store.mark_completed("issues-2", 3.0, 100, 2_500).expect("complete");

    let now = 10_000;
    let snapshot =
        build_status_snapshot(&store, None, 1_000_000, 1_000_000, now).expect("snapshot");
    assert_eq!(snapshot.hourly_rate, 3.0);
    assert_eq!(snapshot.total_spend, 3.0);
    assert_eq!(snapshot.status_counts.pending, 1);
    assert_eq!(snapshot.status_counts.completed, 1);
    assert_eq!(snapshot.deferred_alerts, 0);
    assert!(snapshot.open_windows.is_empty());
    assert_eq!(snapshot.oldest_unfinished_age_ms, Some(9_000));
}
