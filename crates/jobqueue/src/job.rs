//! Job model, retry policy and queue statistics.

use chrono::{DateTime, Utc};

/// Job lifecycle state. Transitions are governed solely by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Per-queue delivery policy.
#[derive(Debug, Clone)]
pub struct JobPolicy {
    /// Handler invocations allowed per job.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Completed jobs retained for inspection.
    pub keep_completed: usize,
    /// Failed jobs retained for inspection.
    pub keep_failed: usize,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

/// Exponential backoff delay before retry number `attempt + 1`.
///
/// `attempt` is the 1-based number of the try that just failed.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
}

/// One claimed job, payload decoded.
#[derive(Debug, Clone)]
pub struct Job<P> {
    pub id: i64,
    pub payload: P,
    /// 1-based number of the current try.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub next_attempt_at: DateTime<Utc>,
}

/// Queue counters as reported by `stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}
