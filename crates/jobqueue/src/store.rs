//! Durable job store backed by `SQLite`.
//!
//! The store owns persistence and visibility: a claimed (`active`) job is
//! invisible to other consumers, and every transition goes through one of
//! the methods here inside a transaction.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::job::{JobPolicy, JobState, QueueStats, backoff_delay_ms};

/// A claimed job before payload decoding.
#[derive(Debug, Clone)]
pub struct RawJob {
    pub id: i64,
    pub payload: String,
    /// 1-based number of the current try.
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// What `fail` decided for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Re-scheduled with backoff; `next_attempt_at` is in the future.
    Rescheduled,
    /// Attempts exhausted; the job is terminally failed.
    Exhausted,
}

/// SQLite-backed job store, keyed by queue name.
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
    queue_name: String,
}

impl JobStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, queue_name: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, queue_name)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(queue_name: &str) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, queue_name)
    }

    fn from_connection(conn: Connection, queue_name: &str) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            queue_name: queue_name.to_string(),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Insert a waiting job; returns its id.
    pub fn enqueue(&self, payload_json: &str, max_attempts: u32, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO jobs (queue, payload, state, attempt, max_attempts, next_attempt_at, created_at, updated_at)
             VALUES (?1, ?2, 'waiting', 0, ?3, ?4, ?4, ?4)",
            params![self.queue_name, payload_json, max_attempts, now.timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the oldest ready job (FIFO among `next_attempt_at <= now`)
    /// and mark it active. `None` when nothing is ready.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<RawJob>> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT id, payload, attempt, max_attempts, next_attempt_at FROM jobs
                 WHERE queue = ?1 AND state IN ('waiting', 'delayed') AND next_attempt_at <= ?2
                 ORDER BY id ASC LIMIT 1",
                params![self.queue_name, now.timestamp_millis()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, payload, attempt, max_attempts, next_attempt_ms)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'active', attempt = attempt + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now.timestamp_millis()],
        )?;
        tx.commit()?;

        Ok(Some(RawJob {
            id,
            payload,
            attempt: attempt + 1,
            max_attempts,
            next_attempt_at: DateTime::from_timestamp_millis(next_attempt_ms)
                .unwrap_or(now),
        }))
    }

    /// Mark a job completed and trim retention.
    pub fn complete(&self, job_id: i64, keep_completed: usize, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE jobs SET state = 'completed', updated_at = ?2 WHERE id = ?1",
            params![job_id, now.timestamp_millis()],
        )?;
        trim_state(&conn, &self.queue_name, JobState::Completed, keep_completed)?;
        Ok(())
    }

    /// Record a handler failure: re-schedule with exponential backoff, or
    /// fail terminally once attempts are exhausted.
    pub fn fail(
        &self,
        job_id: i64,
        error: &str,
        policy: &JobPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryDisposition> {
        let conn = self.lock_conn();
        let attempt: u32 = conn.query_row(
            "SELECT attempt FROM jobs WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;

        if attempt >= policy.max_attempts {
            conn.execute(
                "UPDATE jobs SET state = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1",
                params![job_id, error, now.timestamp_millis()],
            )?;
            trim_state(&conn, &self.queue_name, JobState::Failed, policy.keep_failed)?;
            return Ok(RetryDisposition::Exhausted);
        }

        let delay_ms = backoff_delay_ms(policy.backoff_base_ms, attempt);
        let next = now + Duration::milliseconds(delay_ms as i64);
        conn.execute(
            "UPDATE jobs SET state = 'delayed', last_error = ?2, next_attempt_at = ?3, updated_at = ?4
             WHERE id = ?1",
            params![job_id, error, next.timestamp_millis(), now.timestamp_millis()],
        )?;
        Ok(RetryDisposition::Rescheduled)
    }

    /// Return crashed-run `active` jobs to `waiting` so they redeliver.
    pub fn recover_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock_conn();
        let recovered = conn.execute(
            "UPDATE jobs SET state = 'waiting', updated_at = ?2 WHERE queue = ?1 AND state = 'active'",
            params![self.queue_name, now.timestamp_millis()],
        )?;
        Ok(recovered as u64)
    }

    /// Delete terminal jobs older than the grace period. Returns the count.
    pub fn clean(&self, grace: Duration, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock_conn();
        let cutoff = (now - grace).timestamp_millis();
        let removed = conn.execute(
            "DELETE FROM jobs WHERE queue = ?1 AND state IN ('completed', 'failed') AND updated_at <= ?2",
            params![self.queue_name, cutoff],
        )?;
        Ok(removed as u64)
    }

    /// Per-state counters.
    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.lock_conn();
        let mut statement = conn.prepare(
            "SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state",
        )?;
        let mut rows = statement.query(params![self.queue_name])?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let count: u64 = row.get(1)?;
            match JobState::parse(&state) {
                Some(JobState::Waiting) => stats.waiting = count,
                Some(JobState::Delayed) => stats.delayed = count,
                Some(JobState::Active) => stats.active = count,
                Some(JobState::Completed) => stats.completed = count,
                Some(JobState::Failed) => stats.failed = count,
                None => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue, state, next_attempt_at)",
        [],
    )?;
    Ok(())
}

/// Keep only the newest `keep` jobs in a terminal state.
fn trim_state(
    conn: &Connection,
    queue_name: &str,
    state: JobState,
    keep: usize,
) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM jobs WHERE queue = ?1 AND state = ?2 AND id NOT IN (
            SELECT id FROM jobs WHERE queue = ?1 AND state = ?2 ORDER BY id DESC LIMIT ?3
        )",
        params![queue_name, state.as_str(), keep as i64],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::open_in_memory("evals").unwrap()
    }

    #[test]
    fn open_creates_schema_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let store = JobStore::open(&path, "evals").unwrap();
        let now = Utc::now();
        store.enqueue("{\"n\":1}", 3, now).unwrap();
        drop(store);

        let reopened = JobStore::open(&path, "evals").unwrap();
        assert_eq!(reopened.stats().unwrap().waiting, 1);
    }

    #[test]
    fn claim_is_fifo_among_ready() {
        let store = store();
        let now = Utc::now();
        let first = store.enqueue("\"a\"", 3, now).unwrap();
        let second = store.enqueue("\"b\"", 3, now).unwrap();
        assert!(first < second);

        let claimed = store.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.payload, "\"a\"");
        assert_eq!(claimed.attempt, 1);

        let claimed = store.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.id, second);
    }

    #[test]
    fn active_jobs_are_invisible() {
        let store = store();
        let now = Utc::now();
        store.enqueue("\"a\"", 3, now).unwrap();
        assert!(store.claim_next(now).unwrap().is_some());
        assert!(store.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn failure_schedules_exponential_backoff() {
        let store = store();
        let policy = JobPolicy::default();
        let now = Utc::now();
        let id = store.enqueue("\"a\"", policy.max_attempts, now).unwrap();

        let job = store.claim_next(now).unwrap().unwrap();
        assert_eq!(
            store.fail(job.id, "boom", &policy, now).unwrap(),
            RetryDisposition::Rescheduled
        );
        assert_eq!(store.stats().unwrap().delayed, 1);

        // Not ready before the backoff elapses.
        assert!(store
            .claim_next(now + Duration::milliseconds(1_999))
            .unwrap()
            .is_none());
        let retried = store
            .claim_next(now + Duration::milliseconds(2_000))
            .unwrap()
            .unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.attempt, 2);
    }

    #[test]
    fn attempts_are_capped() {
        let store = store();
        let policy = JobPolicy {
            max_attempts: 2,
            backoff_base_ms: 0,
            ..JobPolicy::default()
        };
        let now = Utc::now();
        store.enqueue("\"a\"", policy.max_attempts, now).unwrap();

        let job = store.claim_next(now).unwrap().unwrap();
        assert_eq!(
            store.fail(job.id, "first", &policy, now).unwrap(),
            RetryDisposition::Rescheduled
        );
        let job = store.claim_next(now).unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(
            store.fail(job.id, "second", &policy, now).unwrap(),
            RetryDisposition::Exhausted
        );
        assert!(store.claim_next(now).unwrap().is_none());
        assert_eq!(store.stats().unwrap().failed, 1);
    }

    #[test]
    fn completed_retention_is_trimmed() {
        let store = store();
        let now = Utc::now();
        for n in 0..5 {
            store.enqueue(&format!("{n}"), 3, now).unwrap();
        }
        for _ in 0..5 {
            let job = store.claim_next(now).unwrap().unwrap();
            store.complete(job.id, 2, now).unwrap();
        }
        let stats = store.stats().unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn recover_returns_active_jobs_to_waiting() {
        let store = store();
        let now = Utc::now();
        store.enqueue("\"a\"", 3, now).unwrap();
        store.claim_next(now).unwrap().unwrap();
        assert_eq!(store.stats().unwrap().active, 1);

        assert_eq!(store.recover_stale(now).unwrap(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 1);
    }

    #[test]
    fn clean_removes_old_terminal_jobs() {
        let store = store();
        let start = Utc::now();
        store.enqueue("\"a\"", 3, start).unwrap();
        let job = store.claim_next(start).unwrap().unwrap();
        store.complete(job.id, 100, start).unwrap();

        let soon = start + Duration::milliseconds(500);
        assert_eq!(store.clean(Duration::milliseconds(1_000), soon).unwrap(), 0);
        let later = start + Duration::milliseconds(1_500);
        assert_eq!(store.clean(Duration::milliseconds(1_000), later).unwrap(), 1);
        assert_eq!(store.stats().unwrap().total, 0);
    }

    #[test]
    fn queues_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let evals = JobStore::open(&path, "evals").unwrap();
        let other = JobStore::open(&path, "other").unwrap();
        let now = Utc::now();
        evals.enqueue("\"a\"", 3, now).unwrap();

        assert!(other.claim_next(now).unwrap().is_none());
        assert_eq!(other.stats().unwrap().total, 0);
        assert_eq!(evals.stats().unwrap().waiting, 1);
    }
}
