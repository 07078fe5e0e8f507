//! Long-running bot mode: channel-fed deliveries plus scheduling ticks.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use sluice_admission::{AdmissionController, AdmissionDecision, ClosedBatch, InboundEvent};
use sluice_core::{current_unix_timestamp_ms, write_json_atomic};
use sluice_dispatch::{DispatchError, Dispatcher};
use sluice_store::StateStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{action_runner::RECONCILE_REASON, build_status_snapshot};

/// Pacing and sweep settings for the bot loop.
#[derive(Debug, Clone)]
pub struct BotRuntimeConfig {
    pub tick_interval_ms: u64,
    pub retention_sweep_every_ticks: u64,
    pub retention_horizon_ms: u64,
    pub pending_sweep_limit: usize,
    pub engine_backoff_ms: u64,
    pub deferred_alert_age_ms: u64,
    /// When set, the observability snapshot is exported here atomically on
    /// every tick for external monitors.
    pub status_path: Option<PathBuf>,
}

/// Drives admission continuously: inbound deliveries admit immediately,
/// ticks flush due windows, re-evaluate deferred work, and run retention.
///
/// Dispatch runs on spawned tasks, so a slow engine call never stalls
/// admission of unrelated batches.
pub struct BotRuntime {
    store: Arc<StateStore>,
    controller: Arc<AdmissionController>,
    dispatcher: Arc<Dispatcher>,
    config: BotRuntimeConfig,
    /// Unix-ms gate set after an engine-unavailable dispatch; the pending
    /// sweep stays quiet until it passes.
    backoff_until_unix_ms: Arc<AtomicU64>,
}

impl BotRuntime {
    pub fn new(
        store: Arc<StateStore>,
        controller: Arc<AdmissionController>,
        dispatcher: Arc<Dispatcher>,
        config: BotRuntimeConfig,
    ) -> Self {
        Self {
            store,
            controller,
            dispatcher,
            config,
            backoff_until_unix_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs until the inbound channel closes or `shutdown` flips to true.
    /// Open windows are drained and dispatched before returning.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let reconciled =
            self.store.reconcile_in_flight(RECONCILE_REASON, current_unix_timestamp_ms())?;
        if reconciled > 0 {
            info!(reconciled, "reconciled interrupted work from a previous run");
        }

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                delivery = inbound.recv() => {
                    let Some(event) = delivery else {
                        break;
                    };
                    self.on_delivery(event);
                }
                _ = interval.tick() => {
                    tick = tick.wrapping_add(1);
                    self.on_tick(tick);
                }
            }
        }

        let drained = self.controller.drain();
        for batch in drained {
            self.spawn_dispatch(batch);
        }
        Ok(())
    }

    fn on_delivery(&self, event: InboundEvent) {
        let now_unix_ms = current_unix_timestamp_ms();
        let event_id = event.id.clone();
        match self.controller.on_event(event, now_unix_ms) {
            Ok(AdmissionDecision::Admitted { batch_id, ready }) => {
                debug!(event_id = %event_id, batch_id = %batch_id, "admitted delivery");
                for batch in ready {
                    self.spawn_dispatch(batch);
                }
            }
            Ok(AdmissionDecision::Deferred { reason }) => {
                debug!(event_id = %event_id, reason = reason.as_str(), "deferred delivery");
            }
            Ok(AdmissionDecision::Rejected { reason }) => {
                warn!(event_id = %event_id, reason = reason.as_str(), "rejected delivery");
            }
            Ok(AdmissionDecision::Duplicate) | Ok(AdmissionDecision::AlreadyInFlight) => {}
            Err(error) => {
                warn!(event_id = %event_id, error = %error, "admission failed for delivery");
            }
        }
    }

    fn on_tick(&self, tick: u64) {
        let now_unix_ms = current_unix_timestamp_ms();
        let mut batches = self.controller.take_due(now_unix_ms);

        if now_unix_ms >= self.backoff_until_unix_ms.load(Ordering::Acquire) {
            match self
                .controller
                .resume_pending(self.config.pending_sweep_limit, now_unix_ms)
            {
                Ok(resumed) => batches.extend(resumed),
                Err(error) => warn!(error = %error, "pending sweep failed"),
            }
        }

        for batch in batches {
            self.spawn_dispatch(batch);
        }

        let every = self.config.retention_sweep_every_ticks;
        if every > 0 && tick % every == 0 {
            if let Err(error) = self.store.sweep(now_unix_ms, self.config.retention_horizon_ms) {
                warn!(error = %error, "retention sweep failed");
            }
        }

        if let Some(status_path) = &self.config.status_path {
            let snapshot = build_status_snapshot(
                &self.store,
                Some(self.controller.as_ref()),
                self.config.retention_horizon_ms,
                self.config.deferred_alert_age_ms,
                now_unix_ms,
            );
            match snapshot {
                Ok(snapshot) => {
                    if let Err(error) = write_json_atomic(status_path, &snapshot) {
                        warn!(error = %error, "failed to export status snapshot");
                    }
                }
                Err(error) => warn!(error = %error, "failed to build status snapshot"),
            }
        }
    }

    fn spawn_dispatch(&self, batch: ClosedBatch) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let backoff_until = Arc::clone(&self.backoff_until_unix_ms);
        let backoff_ms = self.config.engine_backoff_ms;
        tokio::spawn(async move {
            match dispatcher.dispatch(batch).await {
                Ok(report) => {
                    debug!(
                        batch_id = %report.batch_id,
                        completed = report.completed,
                        failed = report.failed,
                        "dispatch finished"
                    );
                }
                Err(DispatchError::EngineUnavailable { reason, reverted }) => {
                    warn!(reason = %reason, reverted, "engine unavailable; backing off");
                    backoff_until.store(
                        current_unix_timestamp_ms().saturating_add(backoff_ms),
                        Ordering::Release,
                    );
                }
                Err(error) => {
                    warn!(error = %error, "dispatch failed");
                }
            }
        });
    }
}
