//! Durable at-least-once job queue over `SQLite`.
//!
//! This crate intentionally exposes a small surface:
//! - a durable job store with FIFO claim and exponential retry
//! - a worker pool with pause/resume and graceful drain
//! - queue statistics for observability

pub mod error;
pub mod job;
pub mod queue;
pub mod store;

pub use error::{QueueError, Result};
pub use job::{Job, JobPolicy, JobState, QueueStats, backoff_delay_ms};
pub use queue::{JobHandler, JobQueue, JobQueueConfig};
pub use store::{JobStore, RawJob, RetryDisposition};
