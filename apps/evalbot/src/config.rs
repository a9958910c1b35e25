//! Environment-driven bot configuration.

use std::collections::HashSet;
use std::path::PathBuf;

use sandbox::{HttpBudgetConfig, SandboxConfig};
use thiserror::Error;

/// Reply budget in grapheme clusters, the protocol's post length unit.
pub const REPLY_GRAPHEME_LIMIT: usize = 300;

/// Configuration error. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Admission control knobs.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Per-principal cooldown between accepted evals in milliseconds.
    pub cooldown_ms: u64,
    /// Global in-flight cap across all workers.
    pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol credentials; required by the bot, not by the REPL.
    pub identifier: Option<String>,
    pub password: Option<String>,
    pub service: String,
    pub jetstream_endpoint: String,
    /// Queue mode: persist mentions through the durable job queue.
    pub use_queue: bool,
    pub queue_path: PathBuf,
    pub queue_name: String,
    pub concurrency: usize,
    pub admin_dids: HashSet<String>,
    pub sandbox: SandboxConfig,
    pub http_budget: HttpBudgetConfig,
    pub admission: AdmissionConfig,
}

impl Config {
    /// Read configuration from `EVALBOT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Credentials, present or a fatal `ConfigError`.
    pub fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        let identifier = self
            .identifier
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::Missing("EVALBOT_IDENTIFIER".to_string()))?;
        let password = self
            .password
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::Missing("EVALBOT_PASSWORD".to_string()))?;
        Ok((identifier, password))
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let use_queue = parse_bool(&lookup, "EVALBOT_USE_QUEUE", false)?;
        // Queue mode tolerates a deeper in-flight backlog; direct mode
        // keeps it tight because every admitted mention holds a task.
        let default_in_flight = if use_queue { 1_000 } else { 100 };

        Ok(Self {
            identifier: lookup("EVALBOT_IDENTIFIER"),
            password: lookup("EVALBOT_PASSWORD"),
            service: lookup("EVALBOT_SERVICE")
                .unwrap_or_else(|| "https://bsky.social".to_string()),
            jetstream_endpoint: lookup("EVALBOT_JETSTREAM")
                .unwrap_or_else(|| "wss://jetstream2.us-east.bsky.network/subscribe".to_string()),
            use_queue,
            queue_path: PathBuf::from(
                lookup("EVALBOT_QUEUE_PATH").unwrap_or_else(|| "evalbot-queue.db".to_string()),
            ),
            queue_name: lookup("EVALBOT_QUEUE_NAME").unwrap_or_else(|| "evals".to_string()),
            concurrency: parse_number(&lookup, "EVALBOT_CONCURRENCY", 10)?,
            admin_dids: lookup("EVALBOT_ADMIN_DIDS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|did| !did.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            sandbox: SandboxConfig {
                timeout_ms: parse_number(&lookup, "EVALBOT_TIMEOUT_MS", 5_000)?,
                stack_bytes: parse_number(&lookup, "EVALBOT_STACK_BYTES", 512 * 1024)?,
                heap_bytes: parse_number(&lookup, "EVALBOT_HEAP_BYTES", 32 * 1024 * 1024)?,
            },
            http_budget: HttpBudgetConfig {
                per_eval_limit: parse_number(&lookup, "EVALBOT_HTTP_PER_EVAL_LIMIT", 5)?,
                window_limit: parse_number(&lookup, "EVALBOT_HTTP_WINDOW_LIMIT", 25)?,
                window_secs: parse_number(&lookup, "EVALBOT_HTTP_WINDOW_SECS", 60)?,
                post_body_limit_bytes: parse_number(
                    &lookup,
                    "EVALBOT_HTTP_POST_BODY_LIMIT",
                    150_000,
                )?,
                response_size_limit_bytes: parse_number(
                    &lookup,
                    "EVALBOT_HTTP_RESPONSE_SIZE_LIMIT",
                    150_000,
                )?,
                request_timeout_ms: parse_number(&lookup, "EVALBOT_HTTP_REQUEST_TIMEOUT_MS", 5_000)?,
            },
            admission: AdmissionConfig {
                cooldown_ms: parse_number(&lookup, "EVALBOT_COOLDOWN_MS", 5_000)?,
                max_in_flight: parse_number(&lookup, "EVALBOT_MAX_IN_FLIGHT", default_in_flight)?,
            },
        })
    }
}

fn parse_bool(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        },
    }
}

fn parse_number<T>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}
