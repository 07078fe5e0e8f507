//! Plain-value policy configuration consumed by the admission controller.

use serde::{Deserialize, Serialize};

use crate::{EventKind, KIND_COUNT};

/// Per-kind admission policy: allowed actions plus batch and token limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindPolicy {
    /// Sub-actions admitted for this kind; everything else is rejected
    /// before any record is written.
    pub actions: Vec<String>,
    pub batch_size: usize,
    /// Floor for token estimates.
    pub min_tokens: u64,
    /// Per-event ceiling; a larger estimate is rejected outright.
    pub max_tokens: u64,
    /// Token budget shared by one batch window.
    pub batch_token_budget: u64,
}

impl KindPolicy {
    /// Defaults matching the supported-event table of the upstream
    /// integrations this engine fronts.
    pub fn default_for(kind: EventKind) -> Self {
        let actions = match kind {
            EventKind::Issue => vec!["opened".to_string(), "edited".to_string()],
            EventKind::PullRequest => vec!["opened".to_string(), "synchronize".to_string()],
            EventKind::Discussion => vec!["created".to_string(), "edited".to_string()],
        };
        Self {
            actions,
            batch_size: 5,
            min_tokens: 64,
            max_tokens: 8_192,
            batch_token_budget: 16_384,
        }
    }

    pub fn allows_action(&self, action: &str) -> bool {
        self.actions.iter().any(|allowed| allowed == action)
    }
}

/// Exhaustive per-kind policy lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindPolicyTable {
    policies: [KindPolicy; KIND_COUNT],
}

impl KindPolicyTable {
    pub fn new(policies: [KindPolicy; KIND_COUNT]) -> Self {
        Self { policies }
    }

    pub fn from_fn(mut build: impl FnMut(EventKind) -> KindPolicy) -> Self {
        Self {
            policies: EventKind::ALL.map(|kind| build(kind)),
        }
    }

    pub fn get(&self, kind: EventKind) -> &KindPolicy {
        &self.policies[kind.index()]
    }
}

impl Default for KindPolicyTable {
    fn default() -> Self {
        Self::from_fn(KindPolicy::default_for)
    }
}

/// Global spend ceilings. A zero ceiling disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostLimits {
    /// Soft-throttle threshold: at or above this hourly rate, admission
    /// spreads spend across kinds instead of bursting one of them.
    pub target_hourly_rate: f64,
    /// Hard stop: at or above this hourly rate no new event is admitted.
    pub max_hourly_rate: f64,
    /// Cumulative spend ceiling over retained ledger entries.
    pub max_total_cost: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            target_hourly_rate: 10.0,
            max_hourly_rate: 15.0,
            max_total_cost: 500.0,
        }
    }
}

/// Request-rate limiter settings, independent of cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub requests_per_hour: u32,
    pub burst: u32,
}

impl RateLimiterSettings {
    pub fn enabled(self) -> bool {
        self.requests_per_hour > 0 && self.burst > 0
    }
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            requests_per_hour: 100,
            burst: 10,
        }
    }
}
