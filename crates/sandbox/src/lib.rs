//! Bounded one-shot execution of untrusted JavaScript.
//!
//! This crate intentionally exposes a small surface:
//! - a per-principal rolling-window HTTP budget ledger
//! - a mediated HTTP capability gated by that ledger
//! - the sandbox engine: one fragment in, one settled value (or error) out

pub mod budget;
pub mod engine;
pub mod error;
pub mod http;
pub mod value;

pub use budget::{BudgetError, HttpBudgetConfig, HttpBudgetLedger};
pub use engine::{EvalOutcome, Sandbox, SandboxConfig, SandboxState};
pub use error::{Result, SandboxError};
pub use http::{HttpResponse, MediatedHttp};
pub use value::render_value;
