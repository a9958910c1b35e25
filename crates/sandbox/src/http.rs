//! Mediated outbound HTTP for sandboxed code.
//!
//! Every request goes through the budget ledger: check, record, then issue
//! with a total deadline and a response-size cap. This is the only network
//! capability sandboxed code can reach.

use std::sync::Arc;
use std::time::Duration;

use crate::budget::HttpBudgetLedger;
use crate::error::{Result, SandboxError};

/// Response surfaced to sandboxed code.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Ledger-mediated HTTP client.
pub struct MediatedHttp {
    ledger: Arc<HttpBudgetLedger>,
    client: reqwest::Client,
}

impl MediatedHttp {
    pub fn new(ledger: Arc<HttpBudgetLedger>) -> Result<Self> {
        let timeout = Duration::from_millis(ledger.config().request_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| SandboxError::Http(format!("HTTP client init failed: {error}")))?;
        Ok(Self { ledger, client })
    }

    pub fn ledger(&self) -> &Arc<HttpBudgetLedger> {
        &self.ledger
    }

    /// Mediated GET.
    pub async fn get(&self, principal: &str, eval_id: u64, url: &str) -> Result<HttpResponse> {
        self.ledger.check_limits(principal, eval_id)?;
        self.ledger.record_request(principal, eval_id);
        let request = self.client.get(normalize_url(url));
        self.run(request).await
    }

    /// Mediated form-encoded POST.
    pub async fn post_form(
        &self,
        principal: &str,
        eval_id: u64,
        url: &str,
        body: &str,
    ) -> Result<HttpResponse> {
        self.ledger.validate_post_body(body.as_bytes())?;
        self.ledger.check_limits(principal, eval_id)?;
        self.ledger.record_request(principal, eval_id);
        let request = self
            .client
            .post(normalize_url(url))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body.to_string());
        self.run(request).await
    }

    async fn run(&self, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let timeout_ms = self.ledger.config().request_timeout_ms;
        let limit = self.ledger.config().response_size_limit_bytes;

        let mut response = request.send().await.map_err(|error| request_error(error, timeout_ms))?;

        let status = response.status();
        let mut headers = Vec::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.push((name.as_str().to_string(), value.to_string()));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|error| request_error(error, timeout_ms))?
        {
            if body.len() + chunk.len() > limit {
                return Err(SandboxError::Http(format!(
                    "Response too large (max {limit} bytes)"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

fn request_error(error: reqwest::Error, timeout_ms: u64) -> SandboxError {
    if error.is_timeout() {
        SandboxError::Http(format!("HTTP request timed out after {timeout_ms} ms"))
    } else {
        SandboxError::Http(format!("HTTP request failed: {error}"))
    }
}

/// Prepend `https://` when the URL carries no scheme.
fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}
