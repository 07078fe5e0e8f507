//! Batch dispatch to the external execution engine.
//!
//! The dispatcher claims records, drives the engine one event at a time,
//! and writes realized outcomes back to the state store. It owns no
//! admission lock, so admission for unrelated batches continues while an
//! engine call blocks.

mod dispatcher;
mod engine;

pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, EventOutcome, OutcomeStatus};
pub use engine::{EngineError, EngineReport, ExecutionEngine};

#[cfg(test)]
mod tests;
