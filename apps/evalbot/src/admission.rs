//! Per-principal cooldown and global in-flight admission control.
//!
//! The cooldown stamp is written on `release`, not on admission, so an
//! in-flight job does not block its own principal twice. Two
//! near-simultaneous mentions from one principal may both be admitted;
//! the global in-flight cap is the backstop.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::AdmissionConfig;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    /// Principal re-mentioned the bot inside its cooldown.
    RejectedRate,
    /// Global in-flight cap reached.
    RejectedQueueFull,
}

struct AdmissionState {
    last_accepted: HashMap<String, DateTime<Utc>>,
    in_flight: usize,
}

/// Admission controller shared by all workers.
pub struct AdmissionController {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdmissionState {
                last_accepted: HashMap::new(),
                in_flight: 0,
            }),
        }
    }

    /// Try to admit one mention from `principal`.
    pub fn try_admit(&self, principal: &str) -> AdmissionDecision {
        self.try_admit_at(principal, Utc::now())
    }

    /// Finish one admitted mention: decrement in-flight and start the
    /// principal's cooldown. Must be called for every admission,
    /// regardless of outcome.
    pub fn release(&self, principal: &str) {
        self.release_at(principal, Utc::now());
    }

    /// Mentions currently being processed.
    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight
    }

    pub(crate) fn try_admit_at(&self, principal: &str, now: DateTime<Utc>) -> AdmissionDecision {
        let mut state = self.lock_state();

        // Stale cooldown entries go on every attempt; the map stays
        // bounded by recent traffic.
        let horizon = now - Duration::hours(1);
        state.last_accepted.retain(|_, at| *at > horizon);

        let cooldown = Duration::milliseconds(self.config.cooldown_ms as i64);
        if let Some(last) = state.last_accepted.get(principal)
            && now - *last < cooldown
        {
            return AdmissionDecision::RejectedRate;
        }
        if state.in_flight >= self.config.max_in_flight {
            return AdmissionDecision::RejectedQueueFull;
        }

        state.in_flight += 1;
        AdmissionDecision::Admitted
    }

    pub(crate) fn release_at(&self, principal: &str, now: DateTime<Utc>) {
        let mut state = self.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_accepted.insert(principal.to_string(), now);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AdmissionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
