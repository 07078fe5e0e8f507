//! Event admission policy: deduplication, cost throttling, and batching.
//!
//! This crate owns every admit/defer/reject decision. It consumes plain
//! config values, reads ledger views from the state store, and never blocks
//! on the execution engine; dispatch happens downstream on the batches it
//! closes.

mod batcher;
mod dedup;
mod event_model;
mod policy_config;
mod rate_limiter;

pub use batcher::{
    AdmissionController, AdmissionDecision, AdmissionSettings, ClosedBatch, CloseReason,
    DeferralReason, RejectionReason, WindowSnapshot,
};
pub use dedup::{DedupOutcome, Deduplicator};
pub use event_model::{estimate_tokens, EventKind, InboundEvent, SizedEvent, KIND_COUNT};
pub use policy_config::{CostLimits, KindPolicy, KindPolicyTable, RateLimiterSettings};
pub use rate_limiter::RateLimiter;
