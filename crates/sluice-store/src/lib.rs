//! Durable state store for event processing records and the cost ledger.
//!
//! Pure persistence: processing records carry the full event snapshot so
//! pending work survives restarts, cost entries are append-only, and every
//! policy decision lives upstream in the admission crate.

use serde::{Deserialize, Serialize};

mod cost_ledger;
mod retention;
mod state_store;

pub use cost_ledger::KindSpend;
pub use retention::SweepReport;
pub use state_store::StateStore;


/// Enumerates supported `RecordStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Deferred,
    InFlight,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deferred => "deferred",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "deferred" => Some(Self::Deferred),
            "in_flight" => Some(Self::InFlight),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal records are never re-admitted and are eligible for retention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Immutable event snapshot persisted with each processing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub event_kind: String,
    pub action: String,
    pub subject_id: String,
    pub token_estimate: u64,
    pub payload_summary: String,
    pub received_at_unix_ms: u64,
}

/// Full processing record row, snapshot plus lifecycle columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub event: StoredEvent,
    pub status: RecordStatus,
    pub deferral_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub admitted_at_unix_ms: Option<u64>,
    pub completed_at_unix_ms: Option<u64>,
    pub realized_cost: Option<f64>,
    pub realized_tokens: Option<u64>,
}

/// Result of the atomic insert-if-absent serialization point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Existing(RecordStatus),
}

/// Per-status record counts for the observability surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub deferred: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn unfinished(&self) -> u64 {
        self.pending
            .saturating_add(self.deferred)
            .saturating_add(self.in_flight)
    }
}
