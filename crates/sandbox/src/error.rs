//! Sandbox error types.

use thiserror::Error;

use crate::budget::BudgetError;

/// Sandbox error type.
///
/// `Display` output is user-visible: the worker prefixes it with
/// `"Error: "` and posts it as the reply.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The wall-clock budget elapsed before the evaluation settled.
    #[error("Evaluation timed out after {0} ms")]
    Timeout(u64),

    /// The interpreter hit its memory or stack cap.
    #[error("Resource limit exceeded: {0}")]
    ResourceExhausted(String),

    /// User code threw or rejected.
    #[error("{0}")]
    User(String),

    /// HTTP budget violation from the ledger.
    #[error("{0}")]
    Budget(#[from] BudgetError),

    /// Outbound HTTP failure.
    #[error("{0}")]
    Http(String),

    /// Interpreter failure outside user code.
    #[error("interpreter error: {0}")]
    Engine(String),
}

/// Sandbox result type.
pub type Result<T> = std::result::Result<T, SandboxError>;
