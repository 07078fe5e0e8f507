//! Read-only observability snapshot over the store and live controller.

use anyhow::Result;
use serde::Serialize;
use sluice_admission::{AdmissionController, WindowSnapshot};
use sluice_core::HOUR_MS;
use sluice_store::{KindSpend, StateStore, StatusCounts};

/// Point-in-time engine status for external monitoring. No side effects.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub now_unix_ms: u64,
    pub hourly_rate: f64,
    pub total_spend: f64,
    pub status_counts: StatusCounts,
    pub spend_by_kind: Vec<KindSpend>,
    /// Empty when no live controller is attached (e.g. the status CLI).
    pub open_windows: Vec<WindowSnapshot>,
    pub rate_limiter_saturation: f64,
    /// Unfinished records older than the retention horizon.
    pub stale_unfinished: u64,
    /// Unfinished records older than the deferral-alert age: deferral is
    /// non-lossy, so old ones mean something is blocking re-admission.
    pub deferred_alerts: u64,
    pub oldest_unfinished_age_ms: Option<u64>,
}

pub fn build_status_snapshot(
    store: &StateStore,
    controller: Option<&AdmissionController>,
    retention_horizon_ms: u64,
    deferred_alert_age_ms: u64,
    now_unix_ms: u64,
) -> Result<StatusSnapshot> {
    Ok(StatusSnapshot {
        now_unix_ms,
        hourly_rate: store.hourly_rate(now_unix_ms)?,
        total_spend: store.total_spend()?,
        status_counts: store.status_counts()?,
        spend_by_kind: store.spend_by_kind(now_unix_ms, HOUR_MS)?,
        open_windows: controller.map(AdmissionController::window_snapshots).unwrap_or_default(),
        rate_limiter_saturation: controller
            .map(AdmissionController::limiter_saturation)
            .unwrap_or(0.0),
        stale_unfinished: store.stale_unfinished_count(now_unix_ms, retention_horizon_ms)?,
        deferred_alerts: store.stale_unfinished_count(now_unix_ms, deferred_alert_age_ms)?,
        oldest_unfinished_age_ms: store.oldest_unfinished_age_ms(now_unix_ms)?,
    })
}
