//! Durable FIFO queue with a bounded worker pool.
//!
//! `concurrency` consumers pull ready jobs in FIFO order. A handler error
//! re-schedules the job with exponential backoff until its attempts are
//! exhausted. Delivery is at least once: a consumer that dies mid-job
//! leaves the job `active`, and `init` returns such jobs to `waiting`.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};
use crate::job::{Job, JobPolicy, JobState, QueueStats};
use crate::store::JobStore;

/// Job consumer.
#[async_trait]
pub trait JobHandler<P>: Send + Sync {
    async fn handle(&self, job: &Job<P>) -> anyhow::Result<()>;
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Parallel consumers.
    pub concurrency: usize,
    /// Delivery policy applied to every job.
    pub policy: JobPolicy,
    /// Idle poll interval; enqueue wakes consumers immediately.
    pub poll_interval: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            policy: JobPolicy::default(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Durable job queue.
pub struct JobQueue<P> {
    store: Arc<JobStore>,
    config: JobQueueConfig,
    paused: Arc<AtomicBool>,
    closed: AtomicBool,
    notify: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> JobQueue<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: JobStore, config: JobQueueConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store: Arc::new(store),
            config,
            paused: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            _payload: PhantomData,
        }
    }

    /// Recover stale jobs from a previous run and start the worker pool.
    pub async fn init(&self, handler: Arc<dyn JobHandler<P>>) -> Result<()> {
        let recovered = self.store.recover_stale(Utc::now())?;
        if recovered > 0 {
            info!(recovered, queue = self.store.queue_name(), "requeued stale active jobs");
        }

        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.config.concurrency.max(1) {
            let store = Arc::clone(&self.store);
            let handler = Arc::clone(&handler);
            let paused = Arc::clone(&self.paused);
            let notify = Arc::clone(&self.notify);
            let policy = self.config.policy.clone();
            let poll_interval = self.config.poll_interval;
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            workers.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if paused.load(Ordering::SeqCst) {
                        if idle_wait(&notify, &mut shutdown_rx, poll_interval).await {
                            break;
                        }
                        continue;
                    }

                    let claimed = match store.claim_next(Utc::now()) {
                        Ok(claimed) => claimed,
                        Err(error) => {
                            warn!(worker_id, "job claim failed: {}", error);
                            None
                        }
                    };

                    let Some(raw) = claimed else {
                        if idle_wait(&notify, &mut shutdown_rx, poll_interval).await {
                            break;
                        }
                        continue;
                    };

                    let job = match serde_json::from_str::<P>(&raw.payload) {
                        Ok(payload) => Job {
                            id: raw.id,
                            payload,
                            attempt: raw.attempt,
                            max_attempts: raw.max_attempts,
                            state: JobState::Active,
                            next_attempt_at: raw.next_attempt_at,
                        },
                        Err(error) => {
                            // Undecodable payloads can never succeed; fail
                            // them terminally instead of burning retries.
                            warn!(job_id = raw.id, "payload decode failed: {}", error);
                            let poisoned = JobPolicy {
                                max_attempts: 0,
                                ..policy.clone()
                            };
                            if let Err(error) = store.fail(
                                raw.id,
                                &format!("payload decode failed: {error}"),
                                &poisoned,
                                Utc::now(),
                            ) {
                                warn!(job_id = raw.id, "failed to record decode error: {}", error);
                            }
                            continue;
                        }
                    };

                    debug!(job_id = job.id, attempt = job.attempt, "job started");
                    match handler.handle(&job).await {
                        Ok(()) => {
                            if let Err(error) =
                                store.complete(job.id, policy.keep_completed, Utc::now())
                            {
                                warn!(job_id = job.id, "failed to mark job completed: {}", error);
                            }
                        }
                        Err(error) => {
                            warn!(job_id = job.id, attempt = job.attempt, "job failed: {error:#}");
                            if let Err(error) =
                                store.fail(job.id, &format!("{error:#}"), &policy, Utc::now())
                            {
                                warn!(job_id = job.id, "failed to record job failure: {}", error);
                            }
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    /// Persist a job; wakes an idle consumer.
    pub fn enqueue(&self, payload: &P) -> Result<i64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let encoded = serde_json::to_string(payload)?;
        let id = self
            .store
            .enqueue(&encoded, self.config.policy.max_attempts, Utc::now())?;
        self.notify.notify_one();
        Ok(id)
    }

    /// Block new dispatch without touching active jobs.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume dispatch.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Drop terminal jobs older than the grace period.
    pub fn clean(&self, grace: Duration) -> Result<u64> {
        let grace = chrono::Duration::from_std(grace)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX));
        self.store.clean(grace, Utc::now())
    }

    /// Queue counters.
    pub fn stats(&self) -> Result<QueueStats> {
        self.store.stats()
    }

    /// Stop accepting work, await in-flight jobs, release the pool.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(error) = worker.await {
                warn!("queue worker join failed: {}", error);
            }
        }
    }
}

/// Wait for work, a poll tick, or shutdown. Returns true on shutdown.
async fn idle_wait(
    notify: &Notify,
    shutdown_rx: &mut watch::Receiver<bool>,
    poll_interval: Duration,
) -> bool {
    tokio::select! {
        _ = notify.notified() => false,
        _ = tokio::time::sleep(poll_interval) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct Payload {
        text: String,
    }

    struct Recorder {
        handled: AtomicU64,
        fail_first: AtomicBool,
    }

    #[async_trait]
    impl JobHandler<Payload> for Recorder {
        async fn handle(&self, job: &Job<Payload>) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.swap(false, Ordering::SeqCst) {
                anyhow::bail!("transient failure on {}", job.payload.text);
            }
            Ok(())
        }
    }

    fn queue(policy: JobPolicy) -> JobQueue<Payload> {
        JobQueue::new(
            JobStore::open_in_memory("evals").unwrap(),
            JobQueueConfig {
                concurrency: 2,
                policy,
                poll_interval: Duration::from_millis(20),
            },
        )
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn jobs_are_dispatched_and_completed() {
        let queue = queue(JobPolicy::default());
        let recorder = Arc::new(Recorder {
            handled: AtomicU64::new(0),
            fail_first: AtomicBool::new(false),
        });
        queue.init(recorder.clone()).await.unwrap();

        for n in 0..5 {
            queue
                .enqueue(&Payload {
                    text: format!("job-{n}"),
                })
                .unwrap();
        }
        wait_until(|| queue.stats().unwrap().completed == 5).await;
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 5);
        queue.close().await;
    }

    #[tokio::test]
    async fn failed_jobs_are_retried() {
        let queue = queue(JobPolicy {
            backoff_base_ms: 10,
            ..JobPolicy::default()
        });
        let recorder = Arc::new(Recorder {
            handled: AtomicU64::new(0),
            fail_first: AtomicBool::new(true),
        });
        queue.init(recorder.clone()).await.unwrap();

        queue
            .enqueue(&Payload {
                text: "flaky".to_string(),
            })
            .unwrap();
        wait_until(|| queue.stats().unwrap().completed == 1).await;
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 2);
        queue.close().await;
    }

    #[tokio::test]
    async fn pause_blocks_dispatch_until_resume() {
        let queue = queue(JobPolicy::default());
        let recorder = Arc::new(Recorder {
            handled: AtomicU64::new(0),
            fail_first: AtomicBool::new(false),
        });
        queue.init(recorder.clone()).await.unwrap();

        queue.pause();
        queue
            .enqueue(&Payload {
                text: "parked".to_string(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().unwrap().waiting, 1);

        queue.resume();
        wait_until(|| queue.stats().unwrap().completed == 1).await;
        queue.close().await;
    }

    #[tokio::test]
    async fn close_rejects_new_work() {
        let queue = queue(JobPolicy::default());
        let recorder = Arc::new(Recorder {
            handled: AtomicU64::new(0),
            fail_first: AtomicBool::new(false),
        });
        queue.init(recorder).await.unwrap();
        queue.close().await;
        assert!(matches!(
            queue.enqueue(&Payload {
                text: "late".to_string()
            }),
            Err(QueueError::Closed)
        ));
    }
}
