//! Idempotent re-entry point for at-least-once event delivery.

use std::sync::Arc;

use anyhow::Result;
use sluice_store::{InsertOutcome, StateStore};
use tracing::debug;

use crate::SizedEvent;

/// Enumerates supported `DedupOutcome` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
    InFlight,
}

/// Consults the state store to absorb re-delivered events. The store's
/// insert-if-absent is the only mutual-exclusion point: when deliveries
/// race, one insert wins and every loser observes `InFlight`.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    store: Arc<StateStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Returns `Duplicate` for terminal records (failed events are not
    /// retried automatically; they need an explicit resubmission),
    /// `InFlight` for unfinished ones, and otherwise inserts a pending
    /// record and returns `New`.
    pub fn admit_for_dedup(&self, sized: &SizedEvent) -> Result<DedupOutcome> {
        match self.store.insert_if_absent(&sized.to_stored())? {
            InsertOutcome::Inserted => Ok(DedupOutcome::New),
            InsertOutcome::Existing(status) => {
                debug!(
                    event_id = %sized.event.id,
                    status = status.as_str(),
                    "absorbed re-delivered event"
                );
                if status.is_terminal() {
                    Ok(DedupOutcome::Duplicate)
                } else {
                    Ok(DedupOutcome::InFlight)
                }
            }
        }
    }
}
