//! SQLite-backed processing-record persistence.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::{InsertOutcome, ProcessingRecord, RecordStatus, StatusCounts, StoredEvent};

/// Durable record store. Each operation opens its own connection; SQLite's
/// unique key on `event_id` is the cross-process serialization point.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Opens the store at `path`, creating the schema when absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        let connection = store.connection()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create state directory {}", parent.display())
                })?;
            }
        }
        let connection = Connection::open(&self.path)
            .with_context(|| format!("failed to open state store {}", self.path.display()))?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    /// Inserts a pending record unless one already exists for the event id.
    ///
    /// The insert is atomic at the storage layer; when two deliveries race,
    /// exactly one observes `Inserted` and the loser reads the winner's row.
    pub fn insert_if_absent(&self, event: &StoredEvent) -> Result<InsertOutcome> {
        let connection = self.connection()?;
        let changed = connection
            .execute(
                r#"
                INSERT INTO processing_records (
                    event_id, event_kind, action, subject_id, token_estimate,
                    payload_summary, received_at_unix_ms, status
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(event_id) DO NOTHING
                "#,
                params![
                    event.event_id,
                    event.event_kind,
                    event.action,
                    event.subject_id,
                    event.token_estimate,
                    event.payload_summary,
                    event.received_at_unix_ms,
                    RecordStatus::Pending.as_str(),
                ],
            )
            .with_context(|| format!("failed to insert record for event {}", event.event_id))?;
        if changed > 0 {
            return Ok(InsertOutcome::Inserted);
        }

        let status: String = connection
            .query_row(
                "SELECT status FROM processing_records WHERE event_id = ?1",
                params![event.event_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to read status for event {}", event.event_id))?;
        let Some(status) = RecordStatus::parse(&status) else {
            bail!(
                "unknown record status '{}' for event {}",
                status,
                event.event_id
            );
        };
        Ok(InsertOutcome::Existing(status))
    }

    /// Records a deferral reason; the row stays eligible for the next sweep.
    pub fn mark_deferred(&self, event_id: &str, reason: &str) -> Result<()> {
        let connection = self.connection()?;
        let changed = connection
            .execute(
                r#"
                UPDATE processing_records
                SET status = ?1, deferral_reason = ?2
                WHERE event_id = ?3 AND status IN ('pending', 'deferred')
                "#,
                params![RecordStatus::Deferred.as_str(), reason, event_id],
            )
            .with_context(|| format!("failed to defer event {}", event_id))?;
        if changed == 0 {
            warn!(event_id, reason, "deferral skipped: record not deferrable");
        }
        Ok(())
    }

    /// Stamps admission time on records accepted into a batch window.
    pub fn mark_admitted(&self, event_ids: &[String], now_unix_ms: u64) -> Result<()> {
        let mut connection = self.connection()?;
        let transaction = connection.transaction()?;
        for event_id in event_ids {
            transaction
                .execute(
                    r#"
                    UPDATE processing_records
                    SET status = ?1, deferral_reason = NULL, admitted_at_unix_ms = ?2
                    WHERE event_id = ?3 AND status IN ('pending', 'deferred')
                    "#,
                    params![RecordStatus::Pending.as_str(), now_unix_ms, event_id],
                )
                .with_context(|| format!("failed to mark event {} admitted", event_id))?;
        }
        transaction.commit().context("failed to commit admission")?;
        Ok(())
    }

    /// Claims records for dispatch by moving them to `in_flight`, returning
    /// the ids actually claimed. A record another process already claimed or
    /// finished is skipped, so racing dispatchers never double-execute.
    pub fn claim_in_flight(&self, event_ids: &[String], now_unix_ms: u64) -> Result<Vec<String>> {
        let mut connection = self.connection()?;
        let transaction = connection.transaction()?;
        let mut claimed = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            let changed = transaction
                .execute(
                    r#"
                    UPDATE processing_records
                    SET status = ?1, admitted_at_unix_ms = COALESCE(admitted_at_unix_ms, ?2)
                    WHERE event_id = ?3 AND status IN ('pending', 'deferred')
                    "#,
                    params![RecordStatus::InFlight.as_str(), now_unix_ms, event_id],
                )
                .with_context(|| format!("failed to claim event {}", event_id))?;
            if changed > 0 {
                claimed.push(event_id.clone());
            }
        }
        transaction.commit().context("failed to commit in-flight claim")?;
        Ok(claimed)
    }

    /// Completes a record and appends its ledger line in one transaction, so
    /// no completed record can exist without a matching cost entry. Returns
    /// false (and writes nothing) when the record is already completed.
    pub fn mark_completed(
        &self,
        event_id: &str,
        realized_cost: f64,
        realized_tokens: u64,
        now_unix_ms: u64,
    ) -> Result<bool> {
        let mut connection = self.connection()?;
        let transaction = connection.transaction()?;
        let event_kind: String = transaction
            .query_row(
                "SELECT event_kind FROM processing_records WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to load record for event {}", event_id))?;
        let changed = transaction
            .execute(
                r#"
                UPDATE processing_records
                SET status = ?1, completed_at_unix_ms = ?2,
                    realized_cost = ?3, realized_tokens = ?4
                WHERE event_id = ?5 AND status != 'completed'
                "#,
                params![
                    RecordStatus::Completed.as_str(),
                    now_unix_ms,
                    realized_cost,
                    realized_tokens,
                    event_id,
                ],
            )
            .with_context(|| format!("failed to complete event {}", event_id))?;
        if changed == 0 {
            return Ok(false);
        }
        transaction
            .execute(
                r#"
                INSERT INTO cost_entries (event_id, event_kind, timestamp_unix_ms, amount, tokens)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    event_id,
                    event_kind,
                    now_unix_ms,
                    realized_cost,
                    realized_tokens
                ],
            )
            .with_context(|| format!("failed to append cost entry for event {}", event_id))?;
        transaction.commit().context("failed to commit completion")?;
        Ok(true)
    }

    pub fn mark_failed(&self, event_id: &str, reason: &str, now_unix_ms: u64) -> Result<()> {
        let connection = self.connection()?;
        connection
            .execute(
                r#"
                UPDATE processing_records
                SET status = ?1, failure_reason = ?2, completed_at_unix_ms = ?3
                WHERE event_id = ?4 AND status != 'completed'
                "#,
                params![RecordStatus::Failed.as_str(), reason, now_unix_ms, event_id],
            )
            .with_context(|| format!("failed to mark event {} failed", event_id))?;
        Ok(())
    }

    /// Returns events to `pending` after an engine-unavailable dispatch, so a
    /// later sweep retries them instead of losing the work.
    pub fn revert_to_pending(&self, event_ids: &[String]) -> Result<()> {
        let mut connection = self.connection()?;
        let transaction = connection.transaction()?;
        for event_id in event_ids {
            transaction
                .execute(
                    r#"
                    UPDATE processing_records
                    SET status = ?1
                    WHERE event_id = ?2 AND status = 'in_flight'
                    "#,
                    params![RecordStatus::Pending.as_str(), event_id],
                )
                .with_context(|| format!("failed to revert event {}", event_id))?;
        }
        transaction.commit().context("failed to commit revert")?;
        Ok(())
    }

    pub fn get(&self, event_id: &str) -> Result<Option<ProcessingRecord>> {
        let connection = self.connection()?;
        connection
            .query_row(
                &format!("{RECORD_SELECT} WHERE event_id = ?1"),
                params![event_id],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load record for event {}", event_id))
    }

    /// Pending and deferred work in FIFO order by receipt time, for the
    /// re-evaluation sweep. Deferral is not loss: everything returned here is
    /// still a live admission candidate.
    pub fn pending_records(&self, limit: usize) -> Result<Vec<ProcessingRecord>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            r#"
            {RECORD_SELECT}
            WHERE status IN ('pending', 'deferred')
            ORDER BY received_at_unix_ms ASC, event_id ASC
            LIMIT ?1
            "#
        ))?;
        let mut rows = statement.query(params![limit as u64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    pub fn in_flight_count_for_subject(&self, subject_id: &str) -> Result<u64> {
        let connection = self.connection()?;
        connection
            .query_row(
                r#"
                SELECT COUNT(1) FROM processing_records
                WHERE subject_id = ?1 AND status = 'in_flight'
                "#,
                params![subject_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count in-flight work for {}", subject_id))
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let connection = self.connection()?;
        let mut statement =
            connection.prepare("SELECT status, COUNT(1) FROM processing_records GROUP BY status")?;
        let mut rows = statement.query([])?;
        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: u64 = row.get(1)?;
            match RecordStatus::parse(&status) {
                Some(RecordStatus::Pending) => counts.pending = count,
                Some(RecordStatus::Deferred) => counts.deferred = count,
                Some(RecordStatus::InFlight) => counts.in_flight = count,
                Some(RecordStatus::Completed) => counts.completed = count,
                Some(RecordStatus::Failed) => counts.failed = count,
                None => warn!(status, "ignoring unknown record status in counts"),
            }
        }
        Ok(counts)
    }

    /// Unfinished records older than `max_age_ms`. Stuck work must surface
    /// as an alert, never disappear in a sweep.
    pub fn stale_unfinished_count(&self, now_unix_ms: u64, max_age_ms: u64) -> Result<u64> {
        let cutoff = now_unix_ms.saturating_sub(max_age_ms);
        let connection = self.connection()?;
        connection
            .query_row(
                r#"
                SELECT COUNT(1) FROM processing_records
                WHERE status IN ('pending', 'deferred', 'in_flight')
                  AND received_at_unix_ms < ?1
                "#,
                params![cutoff],
                |row| row.get(0),
            )
            .context("failed to count stale unfinished records")
    }

    pub fn oldest_unfinished_age_ms(&self, now_unix_ms: u64) -> Result<Option<u64>> {
        let connection = self.connection()?;
        let oldest: Option<u64> = connection.query_row(
            r#"
            SELECT MIN(received_at_unix_ms) FROM processing_records
            WHERE status IN ('pending', 'deferred', 'in_flight')
            "#,
            [],
            |row| row.get(0),
        )?;
        Ok(oldest.map(|value| now_unix_ms.saturating_sub(value)))
    }

    /// Restart reconciliation: anything still `in_flight` was interrupted
    /// before its outcome was confirmed and is marked failed-to-confirm.
    /// Resubmission stays a deliberate operator or policy decision.
    pub fn reconcile_in_flight(&self, reason: &str, now_unix_ms: u64) -> Result<u64> {
        let connection = self.connection()?;
        let changed = connection
            .execute(
                r#"
                UPDATE processing_records
                SET status = ?1, failure_reason = ?2, completed_at_unix_ms = ?3
                WHERE status = 'in_flight'
                "#,
                params![RecordStatus::Failed.as_str(), reason, now_unix_ms],
            )
            .context("failed to reconcile in-flight records")?;
        if changed > 0 {
            warn!(count = changed, reason, "reconciled interrupted records");
        }
        Ok(changed as u64)
    }
}

const RECORD_SELECT: &str = r#"
    SELECT event_id, event_kind, action, subject_id, token_estimate,
           payload_summary, received_at_unix_ms, status, deferral_reason,
           failure_reason, admitted_at_unix_ms, completed_at_unix_ms,
           realized_cost, realized_tokens
    FROM processing_records
"#;

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessingRecord> {
    let status: String = row.get(7)?;
    let status = RecordStatus::parse(&status).unwrap_or(RecordStatus::Failed);
    Ok(ProcessingRecord {
        event: StoredEvent {
            event_id: row.get(0)?,
            event_kind: row.get(1)?,
            action: row.get(2)?,
            subject_id: row.get(3)?,
            token_estimate: row.get(4)?,
            payload_summary: row.get(5)?,
            received_at_unix_ms: row.get(6)?,
        },
        status,
        deferral_reason: row.get(8)?,
        failure_reason: row.get(9)?,
        admitted_at_unix_ms: row.get(10)?,
        completed_at_unix_ms: row.get(11)?,
        realized_cost: row.get(12)?,
        realized_tokens: row.get(13)?,
    })
}

fn initialize_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS processing_records (
                event_id TEXT PRIMARY KEY,
                event_kind TEXT NOT NULL,
                action TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                token_estimate INTEGER NOT NULL,
                payload_summary TEXT NOT NULL,
                received_at_unix_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                deferral_reason TEXT NULL,
                failure_reason TEXT NULL,
                admitted_at_unix_ms INTEGER NULL,
                completed_at_unix_ms INTEGER NULL,
                realized_cost REAL NULL,
                realized_tokens INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_records_status
                ON processing_records(status);
            CREATE INDEX IF NOT EXISTS idx_processing_records_subject
                ON processing_records(subject_id, status);
            CREATE INDEX IF NOT EXISTS idx_processing_records_received
                ON processing_records(received_at_unix_ms);
            CREATE TABLE IF NOT EXISTS cost_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                timestamp_unix_ms INTEGER NOT NULL,
                amount REAL NOT NULL,
                tokens INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cost_entries_timestamp
                ON cost_entries(timestamp_unix_ms);
            "#,
        )
        .context("failed to initialize state store schema")?;
    Ok(())
}
