//! Normalized event model shared by the admission pipeline.

use serde::{Deserialize, Serialize};
use sluice_store::{ProcessingRecord, StoredEvent};

/// Number of supported event kinds; sized for the per-kind window slots.
pub const KIND_COUNT: usize = 3;

/// Enumerates supported `EventKind` values. The set is closed: every policy
/// table and window slot is exhaustive over these three kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Discussion,
    Issue,
    PullRequest,
}

impl EventKind {
    /// Fixed ordering used for window slots and deterministic sweeps.
    pub const ALL: [EventKind; KIND_COUNT] =
        [EventKind::Discussion, EventKind::Issue, EventKind::PullRequest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discussion => "discussion",
            Self::Issue => "issue",
            Self::PullRequest => "pull_request",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discussion" => Some(Self::Discussion),
            "issue" => Some(Self::Issue),
            "pull_request" => Some(Self::PullRequest),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Discussion => 0,
            Self::Issue => 1,
            Self::PullRequest => 2,
        }
    }
}

/// One unit of external activity, normalized by the ingestion gateway.
/// Read-only after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub kind: EventKind,
    pub action: String,
    pub subject_id: String,
    pub payload_summary: String,
    pub received_at_unix_ms: u64,
}

/// An inbound event paired with its pre-admission token estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedEvent {
    pub event: InboundEvent,
    pub token_estimate: u64,
}

impl SizedEvent {
    pub fn to_stored(&self) -> StoredEvent {
        StoredEvent {
            event_id: self.event.id.clone(),
            event_kind: self.event.kind.as_str().to_string(),
            action: self.event.action.clone(),
            subject_id: self.event.subject_id.clone(),
            token_estimate: self.token_estimate,
            payload_summary: self.event.payload_summary.clone(),
            received_at_unix_ms: self.event.received_at_unix_ms,
        }
    }

    /// Rebuilds the admission-side view from a persisted record, for the
    /// re-evaluation sweep after deferral or a restart.
    pub fn from_record(record: &ProcessingRecord) -> Option<Self> {
        let kind = EventKind::parse(&record.event.event_kind)?;
        Some(Self {
            event: InboundEvent {
                id: record.event.event_id.clone(),
                kind,
                action: record.event.action.clone(),
                subject_id: record.event.subject_id.clone(),
                payload_summary: record.event.payload_summary.clone(),
                received_at_unix_ms: record.event.received_at_unix_ms,
            },
            token_estimate: record.event.token_estimate,
        })
    }
}

/// Estimates processing tokens from the payload summary before admission.
/// Roughly four characters per token, floored at the kind's minimum.
pub fn estimate_tokens(payload_summary: &str, min_tokens: u64) -> u64 {
    let chars = payload_summary.chars().count() as u64;
    chars.div_ceil(4).max(min_tokens)
}
