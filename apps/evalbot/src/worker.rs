//! Per-job evaluation pipeline.
//!
//! One handler invocation per mention: admit, extract, execute in a fresh
//! sandbox, format, reply, count. Admission release and sandbox disposal
//! happen on every path.

use std::sync::Arc;

use async_trait::async_trait;
use jetstream::Mention;
use jobqueue::{Job, JobHandler};
use sandbox::{HttpBudgetLedger, Sandbox, SandboxConfig};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::client::PostClient;
use crate::command::{NO_CODE_REPLY, extract_code, format_result, truncate_graphemes};
use crate::config::REPLY_GRAPHEME_LIMIT;
use crate::metrics::BotMetrics;

/// Shared evaluation worker; one `process` call handles one mention.
pub struct EvalWorker {
    admission: Arc<AdmissionController>,
    ledger: Arc<HttpBudgetLedger>,
    sandbox_config: SandboxConfig,
    client: Arc<dyn PostClient>,
    metrics: Arc<BotMetrics>,
    bot_handle: String,
    bot_did: String,
}

impl EvalWorker {
    pub fn new(
        admission: Arc<AdmissionController>,
        ledger: Arc<HttpBudgetLedger>,
        sandbox_config: SandboxConfig,
        client: Arc<dyn PostClient>,
        metrics: Arc<BotMetrics>,
        bot_handle: impl Into<String>,
        bot_did: impl Into<String>,
    ) -> Self {
        Self {
            admission,
            ledger,
            sandbox_config,
            client,
            metrics,
            bot_handle: bot_handle.into(),
            bot_did: bot_did.into(),
        }
    }

    pub fn metrics(&self) -> &BotMetrics {
        &self.metrics
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Handle one mention end to end.
    ///
    /// An `Err` surfaces to the queue for retry accounting; admission
    /// rejects and error-path reply failures resolve to `Ok` so they are
    /// not redelivered.
    pub async fn process(&self, mention: &Mention) -> anyhow::Result<()> {
        match self.admission.try_admit(&mention.author_did) {
            AdmissionDecision::Admitted => {}
            decision => {
                self.metrics.incr_rate_limited();
                debug!(author = %mention.author_did, ?decision, "mention rejected");
                return Ok(());
            }
        }

        let result = self.run_admitted(mention).await;
        self.admission.release(&mention.author_did);
        result
    }

    async fn run_admitted(&self, mention: &Mention) -> anyhow::Result<()> {
        let parent = mention.post_ref();
        let root = mention.root_ref();

        let Some(code) = extract_code(&mention.record, &self.bot_handle, &self.bot_did) else {
            debug!(author = %mention.author_did, "mention without code");
            if let Err(error) = self.client.post_reply(NO_CODE_REPLY, &parent, &root).await {
                warn!(uri = %mention.post_uri, "no-code reply failed: {error}");
            }
            return Ok(());
        };

        let mut sandbox =
            match Sandbox::new(self.sandbox_config.clone(), Arc::clone(&self.ledger)).await {
                Ok(sandbox) => sandbox,
                Err(error) => {
                    // Best-effort error reply before surfacing for retry.
                    let text = "Error: evaluation failed to start";
                    if let Err(post_error) = self.client.post_reply(text, &parent, &root).await {
                        warn!(uri = %mention.post_uri, "error reply failed: {post_error}");
                    }
                    return Err(anyhow::Error::new(error).context("sandbox init"));
                }
            };

        let outcome = sandbox.execute(&code, &mention.author_did).await;
        sandbox.dispose().await;

        let was_error = outcome.result.is_err();
        self.metrics.incr_processed();
        if was_error {
            self.metrics.incr_failed();
        } else {
            self.metrics.incr_successful();
        }

        let text = truncate_graphemes(&format_result(&outcome), REPLY_GRAPHEME_LIMIT);
        match self.client.post_reply(&text, &parent, &root).await {
            Ok(()) => {
                info!(author = %mention.author_did, ok = !was_error, "reply posted");
                Ok(())
            }
            Err(error) if was_error => {
                // Failures on the error-reply path are dropped.
                warn!(uri = %mention.post_uri, "error reply failed: {error}");
                Ok(())
            }
            Err(error) => {
                warn!(uri = %mention.post_uri, "reply failed: {error}");
                Err(anyhow::Error::new(error).context("post reply"))
            }
        }
    }
}

/// Queue-mode adapter: one job wraps one mention.
pub struct MentionJobHandler {
    worker: Arc<EvalWorker>,
}

impl MentionJobHandler {
    pub fn new(worker: Arc<EvalWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl JobHandler<Mention> for MentionJobHandler {
    async fn handle(&self, job: &Job<Mention>) -> anyhow::Result<()> {
        self.worker.process(&job.payload).await
    }
}
