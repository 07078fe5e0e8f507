//! Process-local token-bucket request limiter.
//!
//! Refill is time-based, so the bucket tolerates restarts by refilling from
//! empty. No persistence; the cost ceilings in the ledger are the durable
//! throttle.

use std::{
    sync::Mutex,
    time::Instant,
};

use crate::RateLimiterSettings;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: capacity = burst, refill = requests_per_hour / 3600 per
/// second. Acquisition never blocks; a `false` means defer, not reject.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimiterSettings,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(settings: RateLimiterSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(BucketState {
                tokens: settings.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_per_second(&self) -> f64 {
        self.settings.requests_per_hour as f64 / 3_600.0
    }

    fn refill_locked(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return;
        }
        let refill = elapsed * self.refill_per_second();
        state.tokens = (state.tokens + refill).min(self.settings.burst as f64);
        state.last_refill = now;
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        if !self.settings.enabled() {
            return true;
        }
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        self.refill_locked(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Fraction of the burst currently consumed, in `[0, 1]`.
    pub fn saturation(&self) -> f64 {
        self.saturation_at(Instant::now())
    }

    pub(crate) fn saturation_at(&self, now: Instant) -> f64 {
        if !self.settings.enabled() {
            return 0.0;
        }
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        self.refill_locked(&mut state, now);
        1.0 - (state.tokens / self.settings.burst as f64).clamp(0.0, 1.0)
    }
}
