//! Single-shot action mode: one delivery payload, one run, one report.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sluice_admission::{AdmissionController, AdmissionDecision, ClosedBatch};
use sluice_core::current_unix_timestamp_ms;
use sluice_dispatch::{DispatchReport, Dispatcher};
use sluice_store::StateStore;
use tracing::info;

use crate::normalize_payload;

pub const RECONCILE_REASON: &str = "unconfirmed_after_restart";

/// Serializable view of one admission decision.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSummary {
    pub event_id: String,
    pub outcome: &'static str,
    pub batch_id: Option<String>,
    pub reason: Option<String>,
}

impl AdmissionSummary {
    pub fn from_decision(event_id: &str, decision: &AdmissionDecision) -> Self {
        let (outcome, batch_id, reason) = match decision {
            AdmissionDecision::Admitted { batch_id, .. } => {
                ("admitted", Some(batch_id.clone()), None)
            }
            AdmissionDecision::Deferred { reason } => {
                ("deferred", None, Some(reason.as_str().to_string()))
            }
            AdmissionDecision::Rejected { reason } => {
                ("rejected", None, Some(reason.as_str().to_string()))
            }
            AdmissionDecision::Duplicate => ("duplicate", None, None),
            AdmissionDecision::AlreadyInFlight => ("in_flight", None, None),
        };
        Self {
            event_id: event_id.to_string(),
            outcome,
            batch_id,
            reason,
        }
    }
}

/// Result of one action-mode invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub admission: AdmissionSummary,
    pub reconciled_in_flight: u64,
    pub resumed_batches: usize,
    pub dispatches: Vec<DispatchReport>,
}

/// Processes one event payload end to end: reconcile leftovers, admit, pick
/// up older pending work, drain every window, and dispatch.
///
/// Engine unavailability propagates as an error so the hosting action run
/// fails visibly and retries later; the reverted records survive in the
/// store either way.
pub async fn run_action(
    store: &StateStore,
    controller: &AdmissionController,
    dispatcher: &Dispatcher,
    payload_path: &Path,
    pending_sweep_limit: usize,
) -> Result<ActionReport> {
    let now_unix_ms = current_unix_timestamp_ms();
    let reconciled_in_flight = store.reconcile_in_flight(RECONCILE_REASON, now_unix_ms)?;

    let raw = std::fs::read_to_string(payload_path)
        .with_context(|| format!("failed to read event payload {}", payload_path.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in event payload {}", payload_path.display()))?;
    let event = normalize_payload(&payload, now_unix_ms)?;
    let event_id = event.id.clone();
    info!(event_id = %event_id, kind = event.kind.as_str(), "processing action event");

    let decision = controller.on_event(event, now_unix_ms)?;
    let admission = AdmissionSummary::from_decision(&event_id, &decision);

    let mut batches: Vec<ClosedBatch> = Vec::new();
    if let AdmissionDecision::Admitted { ready, .. } = decision {
        batches.extend(ready);
    }
    let resumed = controller.resume_pending(pending_sweep_limit, now_unix_ms)?;
    let resumed_batches = resumed.len();
    batches.extend(resumed);
    batches.extend(controller.drain());

    let mut dispatches = Vec::with_capacity(batches.len());
    for batch in batches {
        let report = dispatcher
            .dispatch(batch)
            .await
            .context("dispatch failed; reverted events will retry on a later run")?;
        dispatches.push(report);
    }

    Ok(ActionReport {
        admission,
        reconciled_in_flight,
        resumed_batches,
        dispatches,
    })
}
