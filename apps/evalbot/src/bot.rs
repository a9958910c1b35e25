//! Bot orchestration: firehose to reply.
//!
//! Wires the subscription, the mention filter, the admission controller
//! and the worker pipeline together, in direct or queue mode, and owns
//! the graceful drain on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jetstream::{JetstreamConfig, JetstreamConnection, Mention, MentionFilter, StreamSignal};
use jobqueue::{JobQueue, JobQueueConfig, JobStore};
use sandbox::HttpBudgetLedger;
use tokio::signal;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::client::{AtprotoClient, PostClient};
use crate::config::Config;
use crate::metrics::BotMetrics;
use crate::worker::{EvalWorker, MentionJobHandler};

/// How long the direct-mode drain waits for in-flight work on shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Run the bot until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let (identifier, password) = {
        let (identifier, password) = config.credentials()?;
        (identifier.to_string(), password.to_string())
    };

    let client: Arc<dyn PostClient> =
        Arc::new(AtprotoClient::new(&config.service, identifier, password));
    client.login().await.context("login")?;
    let profile = client.get_profile().await.context("resolve profile")?;
    info!(handle = %profile.handle, did = %profile.did, "logged in");
    if !config.admin_dids.is_empty() {
        info!(count = config.admin_dids.len(), "admin dids configured");
    }

    let ledger = Arc::new(HttpBudgetLedger::new(config.http_budget.clone()));
    let admission = Arc::new(AdmissionController::new(config.admission.clone()));
    let metrics = Arc::new(BotMetrics::default());
    let worker = Arc::new(EvalWorker::new(
        Arc::clone(&admission),
        ledger,
        config.sandbox.clone(),
        client,
        Arc::clone(&metrics),
        profile.handle.clone(),
        profile.did.clone(),
    ));
    let filter = MentionFilter::new(&profile.handle, &profile.did);

    let queue = if config.use_queue {
        let store =
            JobStore::open(&config.queue_path, &config.queue_name).context("open job store")?;
        let queue = Arc::new(JobQueue::<Mention>::new(
            store,
            JobQueueConfig {
                concurrency: config.concurrency,
                ..JobQueueConfig::default()
            },
        ));
        queue
            .init(Arc::new(MentionJobHandler::new(Arc::clone(&worker))))
            .await
            .context("start queue workers")?;
        info!(path = %config.queue_path.display(), "queue mode enabled");
        Some(queue)
    } else {
        None
    };

    let connection = JetstreamConnection::new(JetstreamConfig {
        endpoint: config.jetstream_endpoint.clone(),
        ..JetstreamConfig::default()
    })
    .context("firehose subscription")?;
    connection.connect().await.context("firehose connect")?;
    info!(url = connection.url(), "firehose subscription started");

    let mut stats_interval = tokio::time::interval(Duration::from_secs(60));
    stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            _ = stats_interval.tick() => {
                let snapshot = metrics.snapshot();
                info!(
                    processed = snapshot.processed,
                    successful = snapshot.successful,
                    failed = snapshot.failed,
                    rate_limited = snapshot.rate_limited,
                    in_flight = admission.in_flight(),
                    skipped_malformed = connection.skipped_malformed(),
                    "worker stats"
                );
                if let Some(queue) = &queue {
                    match queue.stats() {
                        Ok(stats) => info!(
                            waiting = stats.waiting,
                            delayed = stats.delayed,
                            active = stats.active,
                            completed = stats.completed,
                            failed = stats.failed,
                            "queue stats"
                        ),
                        Err(error) => warn!("queue stats failed: {error}"),
                    }
                }
            }
            signal = connection.recv() => match signal {
                Some(StreamSignal::Connected) => info!("firehose connected"),
                Some(StreamSignal::Disconnected { reason }) => {
                    warn!(%reason, "firehose disconnected");
                }
                Some(StreamSignal::Event(event)) => {
                    if let Some(mention) = filter.matches(&event) {
                        dispatch(mention, queue.as_ref(), &worker);
                    }
                }
                None => {
                    warn!("firehose channel closed");
                    break;
                }
            }
        }
    }

    // Graceful drain: stop intake, await in-flight work, tear down.
    connection.disconnect().await;
    if let Some(queue) = &queue {
        queue.close().await;
    } else {
        drain_direct(&admission, DRAIN_GRACE).await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Hand a mention to the queue, or spawn it directly under the in-flight
/// cap.
fn dispatch(
    mention: Mention,
    queue: Option<&Arc<JobQueue<Mention>>>,
    worker: &Arc<EvalWorker>,
) {
    match queue {
        Some(queue) => {
            if let Err(enqueue_error) = queue.enqueue(&mention) {
                error!(uri = %mention.post_uri, "enqueue failed: {enqueue_error}");
            }
        }
        None => {
            let worker = Arc::clone(worker);
            tokio::spawn(async move {
                if let Err(process_error) = worker.process(&mention).await {
                    warn!(uri = %mention.post_uri, "mention processing failed: {process_error:#}");
                }
            });
        }
    }
}

async fn drain_direct(admission: &AdmissionController, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let in_flight = admission.in_flight();
        if in_flight == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(in_flight, "drain grace elapsed with work still in flight");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!("sigterm handler failed: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
