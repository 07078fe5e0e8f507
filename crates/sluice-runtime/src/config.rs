//! TOML configuration for both runtime modes.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sluice_admission::{
    AdmissionSettings, CostLimits, EventKind, KindPolicy, KindPolicyTable, RateLimiterSettings,
};
use sluice_core::HOUR_MS;

/// Top-level configuration. Every table and field has a default, so an
/// empty file (or none at all) yields a working engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub limits: CostLimits,
    pub rate_limiter: RateLimiterSettings,
    pub batching: BatchingConfig,
    pub retention: RetentionConfig,
    pub dispatch: DispatchConfig,
    pub engine: EngineConfig,
    pub bot: BotConfig,
    pub kinds: KindsConfig,
}

impl SluiceConfig {
    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            policies: self.kinds.table(),
            limits: self.limits,
            rate_limiter: self.rate_limiter,
            flush_interval_ms: self.batching.flush_interval_ms,
            max_in_flight_per_subject: self.batching.max_in_flight_per_subject,
        }
    }

    pub fn retention_horizon_ms(&self) -> u64 {
        self.retention.horizon_days.saturating_mul(24 * HOUR_MS)
    }
}

/// Batch window pacing and per-subject concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub flush_interval_ms: u64,
    /// Zero disables the cap.
    pub max_in_flight_per_subject: u64,
    pub pending_sweep_limit: usize,
    /// A record unfinished for longer than this raises a snapshot alert.
    pub deferred_alert_age_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 30_000,
            max_in_flight_per_subject: 0,
            pending_sweep_limit: 64,
            deferred_alert_age_ms: HOUR_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub horizon_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { horizon_days: 30 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-event engine timeout; zero disables it.
    pub event_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_timeout_ms: 600_000,
        }
    }
}

/// External execution-engine binding for the CLI runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Command invoked once per event with the event JSON on stdin; must
    /// print a `{"cost": .., "tokens": ..}` report on stdout.
    pub command: Vec<String>,
}

/// Bot-loop pacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub tick_interval_ms: u64,
    /// Retention runs every N ticks; zero disables periodic sweeps.
    pub retention_sweep_every_ticks: u64,
    /// Pause before re-admitting work after the engine reports unavailable.
    pub engine_backoff_ms: u64,
    /// Snapshot file exported each tick for external monitors; unset
    /// disables the export.
    pub status_path: Option<std::path::PathBuf>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            retention_sweep_every_ticks: 3_600,
            engine_backoff_ms: 5_000,
            status_path: None,
        }
    }
}

/// Per-kind policy tables. Overriding a kind replaces its whole policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindsConfig {
    pub issue: KindPolicy,
    pub pull_request: KindPolicy,
    pub discussion: KindPolicy,
}

impl Default for KindsConfig {
    fn default() -> Self {
        Self {
            issue: KindPolicy::default_for(EventKind::Issue),
            pull_request: KindPolicy::default_for(EventKind::PullRequest),
            discussion: KindPolicy::default_for(EventKind::Discussion),
        }
    }
}

impl KindsConfig {
    pub fn table(&self) -> KindPolicyTable {
        KindPolicyTable::from_fn(|kind| match kind {
            EventKind::Issue => self.issue.clone(),
            EventKind::PullRequest => self.pull_request.clone(),
            EventKind::Discussion => self.discussion.clone(),
        })
    }
}

/// Loads configuration from a TOML file; `None` yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<SluiceConfig> {
    let Some(path) = path else {
        return Ok(SluiceConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}
