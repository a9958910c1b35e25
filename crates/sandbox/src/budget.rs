//! Per-principal rolling-window HTTP budget accounting.
//!
//! Process-wide ledger shared by every sandbox. Keyed by principal; each
//! check or record prunes the principal's history to the configured window,
//! so the maps stay bounded without a background sweeper.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Budget violation raised by the ledger.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Too many HTTP requests in this eval (max {0} requests)")]
    PerEvalExceeded(u32),

    #[error("Too many HTTP requests in the last {window_secs} seconds (max {limit} requests)")]
    WindowExceeded { window_secs: u64, limit: u32 },

    #[error("POST body too large (max {0} bytes)")]
    BodyTooLarge(usize),
}

/// HTTP budget configuration.
#[derive(Debug, Clone)]
pub struct HttpBudgetConfig {
    /// Requests allowed within one eval.
    pub per_eval_limit: u32,
    /// Requests allowed per principal within the rolling window.
    pub window_limit: u32,
    /// Rolling window length in seconds.
    pub window_secs: u64,
    /// Maximum outbound POST body size in bytes.
    pub post_body_limit_bytes: usize,
    /// Maximum response body size in bytes.
    pub response_size_limit_bytes: usize,
    /// Total deadline for one outbound request in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for HttpBudgetConfig {
    fn default() -> Self {
        Self {
            per_eval_limit: 5,
            window_limit: 25,
            window_secs: 60,
            post_body_limit_bytes: 150_000,
            response_size_limit_bytes: 150_000,
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    at: DateTime<Utc>,
    #[allow(dead_code)]
    eval_id: u64,
}

#[derive(Default)]
struct LedgerState {
    next_eval_id: u64,
    per_eval: HashMap<u64, u32>,
    windows: HashMap<String, Vec<WindowEntry>>,
}

/// Process-wide HTTP budget ledger.
///
/// Serialization boundary is a single coarse lock; calls are short and the
/// ledger is the only mutable state shared across workers.
pub struct HttpBudgetLedger {
    config: HttpBudgetConfig,
    state: Mutex<LedgerState>,
}

impl HttpBudgetLedger {
    pub fn new(config: HttpBudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> &HttpBudgetConfig {
        &self.config
    }

    /// Allocate a monotonically increasing eval id and reset its request
    /// counter.
    pub fn begin_eval(&self, _principal: &str) -> u64 {
        let mut state = self.lock_state();
        state.next_eval_id += 1;
        let eval_id = state.next_eval_id;
        state.per_eval.insert(eval_id, 0);
        eval_id
    }

    /// Drop the per-eval counter once the sandbox is disposed.
    pub fn finish_eval(&self, eval_id: u64) {
        self.lock_state().per_eval.remove(&eval_id);
    }

    /// Fail if the next request would exceed the per-eval or rolling-window
    /// limit.
    pub fn check_limits(&self, principal: &str, eval_id: u64) -> Result<(), BudgetError> {
        self.check_limits_at(principal, eval_id, Utc::now())
    }

    /// Append a request to the principal's history and bump the eval
    /// counter.
    pub fn record_request(&self, principal: &str, eval_id: u64) {
        self.record_request_at(principal, eval_id, Utc::now());
    }

    /// Fail if an outbound POST body exceeds the configured cap.
    pub fn validate_post_body(&self, body: &[u8]) -> Result<(), BudgetError> {
        if body.len() > self.config.post_body_limit_bytes {
            return Err(BudgetError::BodyTooLarge(self.config.post_body_limit_bytes));
        }
        Ok(())
    }

    /// Entries currently inside the principal's window. Prunes on access.
    pub fn window_len(&self, principal: &str) -> usize {
        self.window_len_at(principal, Utc::now())
    }

    pub(crate) fn check_limits_at(
        &self,
        principal: &str,
        eval_id: u64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetError> {
        let mut state = self.lock_state();
        let used = state.per_eval.get(&eval_id).copied().unwrap_or(0);
        if used >= self.config.per_eval_limit {
            return Err(BudgetError::PerEvalExceeded(self.config.per_eval_limit));
        }

        let window = prune(
            state.windows.entry(principal.to_string()).or_default(),
            now,
            self.config.window_secs,
        );
        if window >= self.config.window_limit as usize {
            return Err(BudgetError::WindowExceeded {
                window_secs: self.config.window_secs,
                limit: self.config.window_limit,
            });
        }
        Ok(())
    }

    pub(crate) fn record_request_at(&self, principal: &str, eval_id: u64, now: DateTime<Utc>) {
        let mut state = self.lock_state();
        *state.per_eval.entry(eval_id).or_insert(0) += 1;
        let entries = state.windows.entry(principal.to_string()).or_default();
        prune(entries, now, self.config.window_secs);
        entries.push(WindowEntry { at: now, eval_id });
    }

    pub(crate) fn window_len_at(&self, principal: &str, now: DateTime<Utc>) -> usize {
        let mut state = self.lock_state();
        match state.windows.get_mut(principal) {
            Some(entries) => prune(entries, now, self.config.window_secs),
            None => 0,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A poisoned ledger lock means a panic mid-update; the state is
        // append-only counters, safe to keep using.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn prune(entries: &mut Vec<WindowEntry>, now: DateTime<Utc>, window_secs: u64) -> usize {
    let cutoff = now - Duration::seconds(window_secs as i64);
    entries.retain(|entry| entry.at > cutoff);
    entries.len()
}
