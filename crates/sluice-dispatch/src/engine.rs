//! Seam to the external execution engine.

use async_trait::async_trait;
use sluice_admission::SizedEvent;
use thiserror::Error;

/// Engine-side failure split the dispatcher must branch on: `Failed` is an
/// outcome for one event, `Unavailable` means the engine could not even try.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("execution failed: {reason}")]
    Failed { reason: String },
    #[error("execution engine unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Realized result for one successfully executed event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineReport {
    pub cost: f64,
    pub tokens_used: u64,
}

/// Trait contract for execution-engine behavior. Engine-side retries are
/// the engine's own concern; the dispatcher only applies its per-event
/// timeout around each call.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, event: &SizedEvent) -> Result<EngineReport, EngineError>;
}
