//! End-to-end pipeline scenarios: raw commit frame in, reply out.

use std::sync::Arc;
use std::time::Duration;

use evalbot::admission::AdmissionController;
use evalbot::client::MockPostClient;
use evalbot::config::AdmissionConfig;
use evalbot::metrics::BotMetrics;
use evalbot::worker::{EvalWorker, MentionJobHandler};
use jetstream::{JetstreamEvent, Mention, MentionFilter};
use jobqueue::{JobQueue, JobQueueConfig, JobStore};
use sandbox::{HttpBudgetConfig, HttpBudgetLedger, SandboxConfig};
use serde_json::json;
use unicode_segmentation::UnicodeSegmentation;

const HANDLE: &str = "bot.example";
const BOT_DID: &str = "did:plc:bot";

fn commit_event(author: &str, text: &str) -> JetstreamEvent {
    serde_json::from_value(json!({
        "did": author,
        "time_us": 1_700_000_000_000_000u64,
        "kind": "commit",
        "commit": {
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": "3kabc",
            "cid": "bafy-mention",
            "record": {
                "$type": "app.bsky.feed.post",
                "text": text,
                "createdAt": "2024-01-01T00:00:00Z"
            }
        }
    }))
    .expect("valid frame")
}

struct Pipeline {
    filter: MentionFilter,
    worker: Arc<EvalWorker>,
    client: Arc<MockPostClient>,
    ledger: Arc<HttpBudgetLedger>,
}

impl Pipeline {
    fn new(budget: HttpBudgetConfig, sandbox: SandboxConfig, cooldown_ms: u64) -> Self {
        let client = Arc::new(MockPostClient::new(HANDLE, BOT_DID));
        let ledger = Arc::new(HttpBudgetLedger::new(budget));
        let worker = Arc::new(EvalWorker::new(
            Arc::new(AdmissionController::new(AdmissionConfig {
                cooldown_ms,
                max_in_flight: 100,
            })),
            Arc::clone(&ledger),
            sandbox,
            client.clone(),
            Arc::new(BotMetrics::default()),
            HANDLE,
            BOT_DID,
        ));
        Self {
            filter: MentionFilter::new(HANDLE, BOT_DID),
            worker,
            client,
            ledger,
        }
    }

    fn defaults() -> Self {
        Self::new(
            HttpBudgetConfig::default(),
            SandboxConfig {
                timeout_ms: 2_000,
                ..SandboxConfig::default()
            },
            5_000,
        )
    }

    async fn post(&self, author: &str, text: &str) -> anyhow::Result<()> {
        let mention = self
            .filter
            .matches(&commit_event(author, text))
            .expect("mention should match");
        self.worker.process(&mention).await
    }

    fn reply_texts(&self) -> Vec<String> {
        self.client
            .replies()
            .into_iter()
            .map(|reply| reply.text)
            .collect()
    }
}

/// Serve `hits` canned 200 responses on a local port.
async fn local_http_server(hits: usize) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        for _ in 0..hits {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response =
                "HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok";
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (addr, handle)
}

#[tokio::test]
async fn pure_expression_replies_with_value() {
    let pipeline = Pipeline::defaults();
    pipeline.post("did:plc:alice", "@bot.example 2 + 2").await.unwrap();
    assert_eq!(pipeline.reply_texts(), vec!["=> 4"]);
}

#[tokio::test]
async fn console_output_precedes_the_value() {
    let pipeline = Pipeline::defaults();
    pipeline
        .post(
            "did:plc:alice",
            "@bot.example console.log('Hello'); 'World'",
        )
        .await
        .unwrap();
    assert_eq!(pipeline.reply_texts(), vec!["Hello\n=> World"]);
}

#[tokio::test]
async fn async_fetch_resolves_and_records_one_request() {
    let (addr, server) = local_http_server(1).await;
    let pipeline = Pipeline::defaults();
    pipeline
        .post(
            "did:plc:alice",
            &format!("@bot.example fetch('http://{addr}/').then(r => r.status)"),
        )
        .await
        .unwrap();
    assert_eq!(pipeline.reply_texts(), vec!["=> 200"]);
    assert_eq!(pipeline.ledger.window_len("did:plc:alice"), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn sixth_fetch_breaches_the_eval_budget() {
    let (addr, server) = local_http_server(5).await;
    let pipeline = Pipeline::defaults();
    pipeline
        .post(
            "did:plc:alice",
            &format!("@bot.example for (let i = 0; i < 6; i++) await fetch('http://{addr}/'); 'done'"),
        )
        .await
        .unwrap();
    assert_eq!(
        pipeline.reply_texts(),
        vec!["Error: Too many HTTP requests in this eval (max 5 requests)"]
    );
    assert_eq!(pipeline.ledger.window_len("did:plc:alice"), 5);
    server.await.unwrap();
}

#[tokio::test]
async fn busy_loop_times_out_without_poisoning_others() {
    let pipeline = Pipeline::new(
        HttpBudgetConfig::default(),
        SandboxConfig {
            timeout_ms: 300,
            ..SandboxConfig::default()
        },
        5_000,
    );
    pipeline
        .post("did:plc:mallory", "@bot.example while (true) {}")
        .await
        .unwrap();
    let replies = pipeline.reply_texts();
    assert!(replies[0].starts_with("Error: "));
    assert!(replies[0].contains("timed out"));

    pipeline.post("did:plc:alice", "@bot.example 1 + 1").await.unwrap();
    assert_eq!(pipeline.reply_texts()[1], "=> 2");
}

#[tokio::test]
async fn rate_limited_principal_gets_no_second_reply() {
    let pipeline = Pipeline::defaults();
    pipeline.post("did:plc:alice", "@bot.example 1").await.unwrap();
    pipeline.post("did:plc:alice", "@bot.example 2").await.unwrap();

    assert_eq!(pipeline.reply_texts(), vec!["=> 1"]);
    assert_eq!(pipeline.worker.metrics().snapshot().rate_limited, 1);
}

#[tokio::test]
async fn long_output_is_truncated_to_the_post_budget() {
    let pipeline = Pipeline::defaults();
    pipeline
        .post("did:plc:alice", "@bot.example 'x'.repeat(400)")
        .await
        .unwrap();
    let replies = pipeline.reply_texts();
    assert_eq!(replies[0].graphemes(true).count(), 300);
    assert!(replies[0].ends_with("..."));
}

#[tokio::test]
async fn queue_mode_delivers_and_replies() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::defaults();
    let store = JobStore::open(&dir.path().join("queue.db"), "evals").unwrap();
    let queue = JobQueue::<Mention>::new(
        store,
        JobQueueConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            ..JobQueueConfig::default()
        },
    );
    queue
        .init(Arc::new(MentionJobHandler::new(Arc::clone(&pipeline.worker))))
        .await
        .unwrap();

    let mention = pipeline
        .filter
        .matches(&commit_event("did:plc:alice", "@bot.example 6 * 7"))
        .unwrap();
    queue.enqueue(&mention).unwrap();

    for _ in 0..200 {
        if queue.stats().unwrap().completed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.stats().unwrap().completed, 1);
    assert_eq!(pipeline.reply_texts(), vec!["=> 42"]);
    queue.close().await;
}
