//! Admission controller: the policy ladder and per-kind batch windows.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use serde::Serialize;
use sluice_store::StateStore;
use tracing::{debug, info};

use crate::{
    CostLimits, DedupOutcome, Deduplicator, EventKind, InboundEvent, KindPolicyTable, RateLimiter,
    RateLimiterSettings, SizedEvent, estimate_tokens, KIND_COUNT,
};

/// Why an event was deferred. Deferral is a non-terminal "not yet": the
/// record stays live and is retried by the next sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferralReason {
    TotalCostCeiling,
    HourlyCostCeiling,
    SoftThrottle,
    RateLimited,
    SubjectSaturated,
}

impl DeferralReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalCostCeiling => "total_cost_ceiling",
            Self::HourlyCostCeiling => "hourly_cost_ceiling",
            Self::SoftThrottle => "soft_throttle",
            Self::RateLimited => "rate_limited",
            Self::SubjectSaturated => "subject_saturated",
        }
    }
}

/// Why an event was rejected permanently. Never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    UnsupportedAction,
    OversizedEvent,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedAction => "unsupported_action",
            Self::OversizedEvent => "oversized_event",
        }
    }
}

/// Per-event admission outcome. Policy decisions are values, not errors.
#[derive(Debug)]
pub enum AdmissionDecision {
    /// Appended to (or solo-closed as) the identified batch. `ready` holds
    /// any windows this admission closed; the caller dispatches them
    /// outside admission locks.
    Admitted {
        batch_id: String,
        ready: Vec<ClosedBatch>,
    },
    Deferred { reason: DeferralReason },
    Rejected { reason: RejectionReason },
    Duplicate,
    AlreadyInFlight,
}

/// Enumerates supported `CloseReason` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    BatchFull,
    BudgetExhausted,
    FlushInterval,
    SoloOversized,
    Drain,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchFull => "batch_full",
            Self::BudgetExhausted => "budget_exhausted",
            Self::FlushInterval => "flush_interval",
            Self::SoloOversized => "solo_oversized",
            Self::Drain => "drain",
        }
    }
}

/// A batch window handed to the dispatcher. Windows are working memory:
/// never persisted, reconstructable from pending records after a restart.
#[derive(Debug, Clone)]
pub struct ClosedBatch {
    pub batch_id: String,
    pub kind: EventKind,
    pub opened_at_unix_ms: u64,
    pub close_reason: CloseReason,
    pub events: Vec<SizedEvent>,
}

impl ClosedBatch {
    pub fn event_ids(&self) -> Vec<String> {
        self.events.iter().map(|sized| sized.event.id.clone()).collect()
    }
}

#[derive(Debug)]
struct BatchWindow {
    batch_id: String,
    kind: EventKind,
    opened_at_unix_ms: u64,
    token_budget_remaining: u64,
    events: Vec<SizedEvent>,
}

impl BatchWindow {
    fn open(batch_id: String, kind: EventKind, now_unix_ms: u64, token_budget: u64) -> Self {
        Self {
            batch_id,
            kind,
            opened_at_unix_ms: now_unix_ms,
            token_budget_remaining: token_budget,
            events: Vec::new(),
        }
    }

    fn push(&mut self, sized: SizedEvent) {
        self.token_budget_remaining =
            self.token_budget_remaining.saturating_sub(sized.token_estimate);
        self.events.push(sized);
    }

    fn close(self, reason: CloseReason) -> ClosedBatch {
        ClosedBatch {
            batch_id: self.batch_id,
            kind: self.kind,
            opened_at_unix_ms: self.opened_at_unix_ms,
            close_reason: reason,
            events: self.events,
        }
    }
}

/// Open-window state for the observability surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub kind: EventKind,
    pub batch_id: String,
    pub size: usize,
    pub token_budget_remaining: u64,
    pub opened_at_unix_ms: u64,
}

/// Plain-value settings for the admission controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionSettings {
    pub policies: KindPolicyTable,
    pub limits: CostLimits,
    pub rate_limiter: RateLimiterSettings,
    /// A window older than this is closed by `take_due` even when not full;
    /// bounded latency beats maximal batching.
    pub flush_interval_ms: u64,
    /// Concurrent in-flight cap per subject; zero means uncapped.
    pub max_in_flight_per_subject: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            policies: KindPolicyTable::default(),
            limits: CostLimits::default(),
            rate_limiter: RateLimiterSettings::default(),
            flush_interval_ms: 30_000,
            max_in_flight_per_subject: 0,
        }
    }
}

/// The policy core: groups deduplicated events into cost-bounded windows
/// and decides admit/defer/reject per event.
///
/// Window mutation happens under a per-kind lock, so concurrent admissions
/// to one window cannot corrupt budget accounting, while distinct kinds
/// admit in parallel. No lock is held across store reads or dispatch.
pub struct AdmissionController {
    store: Arc<StateStore>,
    dedup: Deduplicator,
    limiter: RateLimiter,
    settings: AdmissionSettings,
    windows: [Mutex<Option<BatchWindow>>; KIND_COUNT],
    batch_seq: AtomicU64,
}

impl AdmissionController {
    pub fn new(store: Arc<StateStore>, settings: AdmissionSettings) -> Self {
        Self {
            dedup: Deduplicator::new(Arc::clone(&store)),
            limiter: RateLimiter::new(settings.rate_limiter),
            store,
            settings,
            windows: [const { Mutex::new(None) }; KIND_COUNT],
            batch_seq: AtomicU64::new(0),
        }
    }

    /// Entry point for fresh deliveries.
    pub fn on_event(&self, event: InboundEvent, now_unix_ms: u64) -> Result<AdmissionDecision> {
        let policy = self.settings.policies.get(event.kind);
        if !policy.allows_action(&event.action) {
            debug!(
                event_id = %event.id,
                kind = event.kind.as_str(),
                action = %event.action,
                "rejected unsupported action"
            );
            return Ok(AdmissionDecision::Rejected {
                reason: RejectionReason::UnsupportedAction,
            });
        }

        let sized = SizedEvent {
            token_estimate: estimate_tokens(&event.payload_summary, policy.min_tokens),
            event,
        };
        match self.dedup.admit_for_dedup(&sized)? {
            DedupOutcome::Duplicate => return Ok(AdmissionDecision::Duplicate),
            DedupOutcome::InFlight => return Ok(AdmissionDecision::AlreadyInFlight),
            DedupOutcome::New => {}
        }

        if sized.token_estimate > policy.max_tokens {
            self.store.mark_failed(
                &sized.event.id,
                RejectionReason::OversizedEvent.as_str(),
                now_unix_ms,
            )?;
            return Ok(AdmissionDecision::Rejected {
                reason: RejectionReason::OversizedEvent,
            });
        }

        self.evaluate(sized, now_unix_ms)
    }

    /// Shared policy ladder for fresh and resumed events. The record for
    /// the event already exists by the time this runs.
    fn evaluate(&self, sized: SizedEvent, now_unix_ms: u64) -> Result<AdmissionDecision> {
        let kind = sized.event.kind;
        let policy = self.settings.policies.get(kind);
        let limits = self.settings.limits;

        if limits.max_total_cost > 0.0 && self.store.total_spend()? >= limits.max_total_cost {
            return self.defer(&sized, DeferralReason::TotalCostCeiling);
        }

        // Cost ceiling dominates the request-rate ceiling: checked first,
        // and a hard stop regardless of limiter state.
        let hourly_rate = self.store.hourly_rate(now_unix_ms)?;
        if limits.max_hourly_rate > 0.0 && hourly_rate >= limits.max_hourly_rate {
            return self.defer(&sized, DeferralReason::HourlyCostCeiling);
        }

        if hourly_rate >= limits.target_hourly_rate {
            // Soft throttle: spread spend by admitting only the kinds whose
            // live window is smallest.
            let sizes = self.live_window_sizes();
            let smallest = sizes.iter().copied().min().unwrap_or(0);
            if sizes[kind.index()] > smallest {
                return self.defer(&sized, DeferralReason::SoftThrottle);
            }
        }

        if !self.limiter.try_acquire() {
            return self.defer(&sized, DeferralReason::RateLimited);
        }

        let subject_cap = self.settings.max_in_flight_per_subject;
        if subject_cap > 0
            && self.store.in_flight_count_for_subject(&sized.event.subject_id)? >= subject_cap
        {
            return self.defer(&sized, DeferralReason::SubjectSaturated);
        }

        // An event that can never fit a window is dispatched alone rather
        // than starved behind a budget it always exceeds.
        if sized.token_estimate > policy.batch_token_budget {
            let batch_id = self.next_batch_id(kind);
            self.store
                .mark_admitted(std::slice::from_ref(&sized.event.id), now_unix_ms)?;
            let mut window =
                BatchWindow::open(batch_id.clone(), kind, now_unix_ms, sized.token_estimate);
            window.push(sized);
            return Ok(AdmissionDecision::Admitted {
                batch_id,
                ready: vec![window.close(CloseReason::SoloOversized)],
            });
        }

        let mut ready = Vec::new();
        let mut slot = self.windows[kind.index()]
            .lock()
            .expect("batch window lock poisoned");
        if let Some(window) = slot.as_ref() {
            let full = window.events.len() >= policy.batch_size;
            if full || window.token_budget_remaining < sized.token_estimate {
                let reason = if full {
                    CloseReason::BatchFull
                } else {
                    CloseReason::BudgetExhausted
                };
                if let Some(window) = slot.take() {
                    ready.push(window.close(reason));
                }
            }
        }
        if slot.is_none() {
            *slot = Some(BatchWindow::open(
                self.next_batch_id(kind),
                kind,
                now_unix_ms,
                policy.batch_token_budget,
            ));
        }

        self.store
            .mark_admitted(std::slice::from_ref(&sized.event.id), now_unix_ms)?;
        let window = slot.as_mut().expect("window just opened");
        window.push(sized);
        let batch_id = window.batch_id.clone();

        let full = window.events.len() >= policy.batch_size;
        if full || window.token_budget_remaining == 0 {
            let reason = if full {
                CloseReason::BatchFull
            } else {
                CloseReason::BudgetExhausted
            };
            if let Some(window) = slot.take() {
                ready.push(window.close(reason));
            }
        }

        Ok(AdmissionDecision::Admitted { batch_id, ready })
    }

    fn defer(&self, sized: &SizedEvent, reason: DeferralReason) -> Result<AdmissionDecision> {
        self.store.mark_deferred(&sized.event.id, reason.as_str())?;
        debug!(
            event_id = %sized.event.id,
            reason = reason.as_str(),
            "deferred event"
        );
        Ok(AdmissionDecision::Deferred { reason })
    }

    /// Re-evaluates deferred and pending records from the store, skipping
    /// events already sitting in an open window. Candidates are ordered by
    /// (live window size of kind, kind name, receipt time): the kind-name
    /// tie-break is the documented deterministic rule for simultaneously
    /// eligible kinds with equal window sizes.
    pub fn resume_pending(&self, limit: usize, now_unix_ms: u64) -> Result<Vec<ClosedBatch>> {
        let records = self.store.pending_records(limit)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let windowed = self.windowed_event_ids();
        let sizes = self.live_window_sizes();

        let mut candidates = Vec::new();
        for record in &records {
            if windowed.contains(&record.event.event_id) {
                continue;
            }
            match SizedEvent::from_record(record) {
                Some(sized) => candidates.push(sized),
                None => {
                    self.store.mark_failed(
                        &record.event.event_id,
                        "unknown_event_kind",
                        now_unix_ms,
                    )?;
                }
            }
        }
        candidates.sort_by(|left, right| {
            let left_key = (
                sizes[left.event.kind.index()],
                left.event.kind.as_str(),
                left.event.received_at_unix_ms,
                left.event.id.as_str(),
            );
            let right_key = (
                sizes[right.event.kind.index()],
                right.event.kind.as_str(),
                right.event.received_at_unix_ms,
                right.event.id.as_str(),
            );
            left_key.cmp(&right_key)
        });

        let mut ready = Vec::new();
        let mut resumed = 0usize;
        for sized in candidates {
            if let AdmissionDecision::Admitted { ready: batches, .. } =
                self.evaluate(sized, now_unix_ms)?
            {
                resumed += 1;
                ready.extend(batches);
            }
        }
        if resumed > 0 {
            info!(resumed, "re-admitted deferred events");
        }
        Ok(ready)
    }

    /// Closes windows older than the flush interval. Eager closure bounds
    /// latency for windows that never fill.
    pub fn take_due(&self, now_unix_ms: u64) -> Vec<ClosedBatch> {
        let mut due = Vec::new();
        for slot in &self.windows {
            let mut slot = slot.lock().expect("batch window lock poisoned");
            let expired = slot.as_ref().is_some_and(|window| {
                now_unix_ms.saturating_sub(window.opened_at_unix_ms) >= self.settings.flush_interval_ms
            });
            if expired {
                if let Some(window) = slot.take() {
                    due.push(window.close(CloseReason::FlushInterval));
                }
            }
        }
        due
    }

    /// Closes every open window. Used by single-shot runs and shutdown.
    pub fn drain(&self) -> Vec<ClosedBatch> {
        let mut drained = Vec::new();
        for slot in &self.windows {
            let mut slot = slot.lock().expect("batch window lock poisoned");
            if let Some(window) = slot.take() {
                drained.push(window.close(CloseReason::Drain));
            }
        }
        drained
    }

    pub fn window_snapshots(&self) -> Vec<WindowSnapshot> {
        let mut snapshots = Vec::new();
        for slot in &self.windows {
            let slot = slot.lock().expect("batch window lock poisoned");
            if let Some(window) = slot.as_ref() {
                snapshots.push(WindowSnapshot {
                    kind: window.kind,
                    batch_id: window.batch_id.clone(),
                    size: window.events.len(),
                    token_budget_remaining: window.token_budget_remaining,
                    opened_at_unix_ms: window.opened_at_unix_ms,
                });
            }
        }
        snapshots
    }

    pub fn limiter_saturation(&self) -> f64 {
        self.limiter.saturation()
    }

    fn live_window_sizes(&self) -> [usize; KIND_COUNT] {
        let mut sizes = [0usize; KIND_COUNT];
        for (index, slot) in self.windows.iter().enumerate() {
            let slot = slot.lock().expect("batch window lock poisoned");
            sizes[index] = slot.as_ref().map_or(0, |window| window.events.len());
        }
        sizes
    }

    fn windowed_event_ids(&self) -> HashSet<String> {
        let mut ids = HashSet::new();
        for slot in &self.windows {
            let slot = slot.lock().expect("batch window lock poisoned");
            if let Some(window) = slot.as_ref() {
                for sized in &window.events {
                    ids.insert(sized.event.id.clone());
                }
            }
        }
        ids
    }

    fn next_batch_id(&self, kind: EventKind) -> String {
        let seq = self.batch_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-batch-{}", kind.as_str(), seq)
    }
}
