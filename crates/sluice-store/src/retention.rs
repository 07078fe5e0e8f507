//! Retention sweep over terminal records and aged ledger entries.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use crate::StateStore;

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub records_deleted: u64,
    pub cost_entries_deleted: u64,
    /// Unfinished records older than the horizon. Left in place and
    /// surfaced here so stuck work becomes an operational alert.
    pub stale_unfinished: u64,
}

impl StateStore {
    /// Deletes terminal records and cost entries older than `horizon_ms`.
    ///
    /// Pending, deferred, and in-flight rows are never deleted regardless of
    /// age; their count is reported instead.
    pub fn sweep(&self, now_unix_ms: u64, horizon_ms: u64) -> Result<SweepReport> {
        let cutoff = now_unix_ms.saturating_sub(horizon_ms);
        let mut connection = self.connection()?;
        let transaction = connection.transaction()?;
        let records_deleted = transaction
            .execute(
                r#"
                DELETE FROM processing_records
                WHERE status IN ('completed', 'failed')
                  AND COALESCE(completed_at_unix_ms, received_at_unix_ms) < ?1
                "#,
                params![cutoff],
            )
            .context("failed to delete aged processing records")?;
        let cost_entries_deleted = transaction
            .execute(
                "DELETE FROM cost_entries WHERE timestamp_unix_ms < ?1",
                params![cutoff],
            )
            .context("failed to delete aged cost entries")?;
        transaction.commit().context("failed to commit sweep")?;

        let stale_unfinished = self.stale_unfinished_count(now_unix_ms, horizon_ms)?;
        let report = SweepReport {
            records_deleted: records_deleted as u64,
            cost_entries_deleted: cost_entries_deleted as u64,
            stale_unfinished,
        };
        if report.records_deleted > 0 || report.cost_entries_deleted > 0 {
            info!(
                records = report.records_deleted,
                cost_entries = report.cost_entries_deleted,
                stale_unfinished = report.stale_unfinished,
                "retention sweep removed aged rows"
            );
        }
        Ok(report)
    }
}
