//! Runtime modes over the admission engine: single-shot action runs and the
//! long-running bot loop, plus payload normalization and the observability
//! snapshot. Both modes share the same admission and accounting logic.

mod action_runner;
mod bot_runtime;
mod config;
mod normalize;
mod status;

pub use action_runner::{run_action, ActionReport, AdmissionSummary};
pub use bot_runtime::{BotRuntime, BotRuntimeConfig};
pub use config::{
    load_config, BatchingConfig, BotConfig, DispatchConfig, EngineConfig, KindsConfig,
    RetentionConfig, SluiceConfig,
};
pub use normalize::{normalize_payload, parse_rfc3339_to_unix_ms, sha256_hex};
pub use status::{build_status_snapshot, StatusSnapshot};

#[cfg(test)]
mod tests;
