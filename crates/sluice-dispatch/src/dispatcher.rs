//! Dispatcher: claims a closed batch and records realized outcomes.

use std::{collections::HashSet, sync::Arc, time::Duration};

use serde::Serialize;
use sluice_admission::ClosedBatch;
use sluice_core::current_unix_timestamp_ms;
use sluice_store::StateStore;
use thiserror::Error;
use tracing::{info, warn};

use crate::{EngineError, ExecutionEngine};

/// Hard failures of a dispatch attempt. Per-event engine failures are
/// outcomes, not errors; only store trouble and engine unavailability
/// propagate.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transient: the unreached part of the batch is back in `pending` and
    /// an outer retry loop should back off before the next attempt.
    #[error("execution engine unavailable: {reason} ({reverted} events reverted to pending)")]
    EngineUnavailable { reason: String, reverted: usize },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Enumerates supported `OutcomeStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    /// Another process finished or claimed this event first; nothing ran.
    Skipped,
}

/// Per-event dispatch outcome.
#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub event_id: String,
    pub status: OutcomeStatus,
    pub cost: Option<f64>,
    pub reason: Option<String>,
}

/// Summary of one dispatched batch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub batch_id: String,
    pub close_reason: String,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub outcomes: Vec<EventOutcome>,
}

/// Hands admitted batches to the execution engine and persists results.
pub struct Dispatcher {
    store: Arc<StateStore>,
    engine: Arc<dyn ExecutionEngine>,
    /// Per-event invocation timeout; zero disables it.
    event_timeout_ms: u64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<StateStore>,
        engine: Arc<dyn ExecutionEngine>,
        event_timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            engine,
            event_timeout_ms,
        }
    }

    /// Executes one closed batch.
    ///
    /// Each event fails or completes on its own: a bad event never fails
    /// its siblings. Engine unavailability reverts this and every unreached
    /// event to `pending`; events that already completed keep their outcome.
    pub async fn dispatch(&self, batch: ClosedBatch) -> Result<DispatchReport, DispatchError> {
        let event_ids = batch.event_ids();
        let claimed: HashSet<String> = self
            .store
            .claim_in_flight(&event_ids, current_unix_timestamp_ms())?
            .into_iter()
            .collect();

        let mut report = DispatchReport {
            batch_id: batch.batch_id.clone(),
            close_reason: batch.close_reason.as_str().to_string(),
            completed: 0,
            failed: 0,
            skipped: 0,
            outcomes: Vec::with_capacity(batch.events.len()),
        };

        for (index, sized) in batch.events.iter().enumerate() {
            let event_id = sized.event.id.clone();
            if !claimed.contains(&event_id) {
                report.skipped += 1;
                report.outcomes.push(EventOutcome {
                    event_id,
                    status: OutcomeStatus::Skipped,
                    cost: None,
                    reason: Some("not_claimed".to_string()),
                });
                continue;
            }

            let execution = self.engine.execute(sized);
            let result = if self.event_timeout_ms == 0 {
                Ok(execution.await)
            } else {
                tokio::time::timeout(Duration::from_millis(self.event_timeout_ms), execution).await
            };

            match result {
                Ok(Ok(engine_report)) => {
                    let recorded = self.store.mark_completed(
                        &event_id,
                        engine_report.cost,
                        engine_report.tokens_used,
                        current_unix_timestamp_ms(),
                    )?;
                    if recorded {
                        report.completed += 1;
                        report.outcomes.push(EventOutcome {
                            event_id,
                            status: OutcomeStatus::Completed,
                            cost: Some(engine_report.cost),
                            reason: None,
                        });
                    } else {
                        report.skipped += 1;
                        report.outcomes.push(EventOutcome {
                            event_id,
                            status: OutcomeStatus::Skipped,
                            cost: None,
                            reason: Some("already_completed".to_string()),
                        });
                    }
                }
                Ok(Err(EngineError::Failed { reason })) => {
                    self.store
                        .mark_failed(&event_id, &reason, current_unix_timestamp_ms())?;
                    report.failed += 1;
                    report.outcomes.push(EventOutcome {
                        event_id,
                        status: OutcomeStatus::Failed,
                        cost: None,
                        reason: Some(reason),
                    });
                }
                Ok(Err(EngineError::Unavailable { reason })) => {
                    let unreached: Vec<String> = batch.events[index..]
                        .iter()
                        .map(|sized| sized.event.id.clone())
                        .filter(|id| claimed.contains(id))
                        .collect();
                    self.store.revert_to_pending(&unreached)?;
                    warn!(
                        batch_id = %batch.batch_id,
                        reason = %reason,
                        reverted = unreached.len(),
                        "engine unavailable; batch remainder reverted to pending"
                    );
                    return Err(DispatchError::EngineUnavailable {
                        reason,
                        reverted: unreached.len(),
                    });
                }
                Err(_elapsed) => {
                    self.store.mark_failed(
                        &event_id,
                        "engine_timeout",
                        current_unix_timestamp_ms(),
                    )?;
                    report.failed += 1;
                    report.outcomes.push(EventOutcome {
                        event_id,
                        status: OutcomeStatus::Failed,
                        cost: None,
                        reason: Some("engine_timeout".to_string()),
                    });
                }
            }
        }

        info!(
            batch_id = %report.batch_id,
            kind = batch.kind.as_str(),
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "dispatched batch"
        );
        Ok(report)
    }
}
