//! Ledger views derived from the append-only cost entries.
//!
//! Rates are always recomputed from the rows inside the trailing window, so
//! the result matches a full re-scan at all times. There is no stored
//! running total to drift.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;
use sluice_core::HOUR_MS;

use crate::StateStore;

/// Spend aggregated per event kind over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindSpend {
    pub event_kind: String,
    pub amount: f64,
    pub entries: u64,
    pub tokens: u64,
}

impl StateStore {
    /// Appends one ledger entry. Entries are immutable once written;
    /// completions go through `mark_completed`, which pairs the record
    /// update with this append in one transaction. This standalone form
    /// exists for out-of-band spend (manual adjustments, imported history).
    pub fn record_cost(
        &self,
        event_id: &str,
        event_kind: &str,
        amount: f64,
        tokens: u64,
        now_unix_ms: u64,
    ) -> Result<()> {
        let connection = self.connection()?;
        connection
            .execute(
                r#"
                INSERT INTO cost_entries (event_id, event_kind, timestamp_unix_ms, amount, tokens)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![event_id, event_kind, now_unix_ms, amount, tokens],
            )
            .with_context(|| format!("failed to append cost entry for event {}", event_id))?;
        Ok(())
    }

    /// Sum of cost entries in the trailing hour ending at `now_unix_ms`.
    pub fn hourly_rate(&self, now_unix_ms: u64) -> Result<f64> {
        self.windowed_spend(now_unix_ms, HOUR_MS)
    }

    pub fn windowed_spend(&self, now_unix_ms: u64, window_ms: u64) -> Result<f64> {
        let start = now_unix_ms.saturating_sub(window_ms);
        let connection = self.connection()?;
        let total: Option<f64> = connection
            .query_row(
                "SELECT SUM(amount) FROM cost_entries WHERE timestamp_unix_ms >= ?1",
                params![start],
                |row| row.get(0),
            )
            .context("failed to compute windowed spend")?;
        Ok(total.unwrap_or(0.0))
    }

    /// Cumulative spend over every retained ledger entry.
    pub fn total_spend(&self) -> Result<f64> {
        let connection = self.connection()?;
        let total: Option<f64> = connection
            .query_row("SELECT SUM(amount) FROM cost_entries", [], |row| row.get(0))
            .context("failed to compute total spend")?;
        Ok(total.unwrap_or(0.0))
    }

    pub fn spend_by_kind(&self, now_unix_ms: u64, window_ms: u64) -> Result<Vec<KindSpend>> {
        let start = now_unix_ms.saturating_sub(window_ms);
        let connection = self.connection()?;
        let mut statement = connection
            .prepare(
                r#"
                SELECT event_kind, SUM(amount), COUNT(1), SUM(tokens)
                FROM cost_entries
                WHERE timestamp_unix_ms >= ?1
                GROUP BY event_kind
                ORDER BY event_kind ASC
                "#,
            )
            .context("failed to prepare spend-by-kind query")?;
        let mut rows = statement.query(params![start])?;
        let mut spends = Vec::new();
        while let Some(row) = rows.next()? {
            spends.push(KindSpend {
                event_kind: row.get(0)?,
                amount: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                entries: row.get(2)?,
                tokens: row.get::<_, Option<u64>>(3)?.unwrap_or(0),
            });
        }
        Ok(spends)
    }
}
