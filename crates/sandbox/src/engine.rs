//! One-shot QuickJS execution with bounded resources.
//!
//! A `Sandbox` runs exactly one code fragment. The embedded interpreter has
//! no ambient authority: the only host functions exposed to user code are
//! `console.log`, `fetch` and `post`, the latter two mediated by the HTTP
//! budget ledger. Wall-clock, heap and stack bounds are enforced by the
//! interpreter itself (interrupt handler, memory limit, stack limit).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::context::EvalOptions;
use rquickjs::function::{Async, Func, Rest};
use rquickjs::{AsyncContext, AsyncRuntime, CatchResultExt, CaughtError, Ctx, Object, Value};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::budget::HttpBudgetLedger;
use crate::error::{Result, SandboxError};
use crate::http::{HttpResponse, MediatedHttp};
use crate::value::{console_form, decode_value};

/// Sandbox resource configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget for one evaluation in milliseconds.
    pub timeout_ms: u64,
    /// Interpreter stack cap in bytes.
    pub stack_bytes: usize,
    /// Interpreter heap cap in bytes.
    pub heap_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            stack_bytes: 512 * 1024,
            heap_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Sandbox lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Initialized,
    Executing,
    Settled,
    TimedOut,
    Failed,
    Disposed,
}

/// Result of running one code fragment.
#[derive(Debug)]
pub struct EvalOutcome {
    /// Settled value (`None` = undefined) or the failure.
    pub result: Result<Option<JsonValue>>,
    /// Console lines captured during the run.
    pub output: Vec<String>,
}

/// Per-execution state shared with the injected capabilities.
///
/// The capabilities read the principal that was current when the call was
/// made. This is only safe because each worker constructs a fresh sandbox
/// per job; the one-job-per-sandbox invariant must hold.
struct EvalShared {
    principal: Mutex<String>,
    eval_id: AtomicU64,
    console: Mutex<Vec<String>>,
    http: MediatedHttp,
}

impl EvalShared {
    fn principal(&self) -> String {
        self.principal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push_line(&self, line: String) {
        self.console
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }

    fn take_lines(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .console
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

const PRELUDE: &str = r#"
(() => {
  const unwrap = (pending) => pending.then((raw) => {
    const response = JSON.parse(raw);
    if (response && response.error !== undefined) {
      throw new Error(response.error);
    }
    return response;
  });
  globalThis.fetch = (url) => unwrap(__host_fetch(String(url)));
  globalThis.post = (url, body) =>
    unwrap(__host_post(String(url), String(body === undefined ? "" : body)));
})();
"#;

/// Executes exactly one code fragment under strict resource bounds.
pub struct Sandbox {
    config: SandboxConfig,
    shared: Arc<EvalShared>,
    runtime: Option<AsyncRuntime>,
    context: Option<AsyncContext>,
    state: SandboxState,
}

impl Sandbox {
    /// Build an initialized sandbox: fresh interpreter, limits applied,
    /// capabilities installed.
    pub async fn new(config: SandboxConfig, ledger: Arc<HttpBudgetLedger>) -> Result<Self> {
        let runtime = AsyncRuntime::new().map_err(engine_error)?;
        runtime.set_memory_limit(config.heap_bytes).await;
        runtime.set_max_stack_size(config.stack_bytes).await;

        let context = AsyncContext::full(&runtime).await.map_err(engine_error)?;

        let shared = Arc::new(EvalShared {
            principal: Mutex::new("default".to_string()),
            eval_id: AtomicU64::new(0),
            console: Mutex::new(Vec::new()),
            http: MediatedHttp::new(ledger)?,
        });

        let install_shared = shared.clone();
        rquickjs::async_with!(context => |ctx| {
            install_capabilities(&ctx, install_shared).catch(&ctx).map_err(|caught| {
                SandboxError::Engine(caught_message(&ctx, &caught))
            })
        })
        .await?;

        Ok(Self {
            config,
            shared,
            runtime: Some(runtime),
            context: Some(context),
            state: SandboxState::Initialized,
        })
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Run one code fragment to completion under `principal`.
    ///
    /// Pending promise values are driven until they settle or the
    /// wall-clock budget elapses; busy loops are aborted by the
    /// interpreter's interrupt handler at the same deadline.
    pub async fn execute(&mut self, code: &str, principal: &str) -> EvalOutcome {
        if self.state != SandboxState::Initialized {
            return EvalOutcome {
                result: Err(SandboxError::Engine(format!(
                    "sandbox is {:?}, expected a fresh instance",
                    self.state
                ))),
                output: Vec::new(),
            };
        }
        self.state = SandboxState::Executing;

        let ledger = self.shared.http.ledger().clone();
        let eval_id = ledger.begin_eval(principal);
        *self
            .shared
            .principal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = principal.to_string();
        self.shared.eval_id.store(eval_id, Ordering::SeqCst);
        self.shared.take_lines();

        let (Some(runtime), Some(context)) = (self.runtime.as_ref(), self.context.as_ref())
        else {
            self.state = SandboxState::Failed;
            return EvalOutcome {
                result: Err(SandboxError::Engine("sandbox disposed".to_string())),
                output: Vec::new(),
            };
        };

        let budget = Duration::from_millis(self.config.timeout_ms);
        let deadline = Instant::now() + budget;
        let timed_out = Arc::new(AtomicBool::new(false));
        let interrupt_flag = timed_out.clone();
        runtime
            .set_interrupt_handler(Some(Box::new(move || {
                if Instant::now() >= deadline {
                    interrupt_flag.store(true, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            })))
            .await;

        let code = code.to_string();
        let run = rquickjs::async_with!(context => |ctx| {
            run_fragment(&ctx, &code).await
        });

        let raw = match tokio::time::timeout(budget, run).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout(self.config.timeout_ms)),
        };

        let result = match raw {
            Err(SandboxError::User(_)) | Err(SandboxError::Engine(_))
                if timed_out.load(Ordering::SeqCst) =>
            {
                Err(SandboxError::Timeout(self.config.timeout_ms))
            }
            Err(SandboxError::User(message)) if is_resource_message(&message) => {
                Err(SandboxError::ResourceExhausted(message))
            }
            other => other,
        };

        ledger.finish_eval(eval_id);
        self.state = match &result {
            Ok(_) => SandboxState::Settled,
            Err(SandboxError::Timeout(_)) => SandboxState::TimedOut,
            Err(_) => SandboxState::Failed,
        };
        debug!(principal, eval_id, state = ?self.state, "sandbox run finished");

        EvalOutcome {
            result,
            output: self.shared.take_lines(),
        }
    }

    /// Release the interpreter. Idempotent; the only operation allowed
    /// after a terminal state.
    pub async fn dispose(&mut self) {
        self.context.take();
        if let Some(runtime) = self.runtime.take() {
            let eval_id = self.shared.eval_id.load(Ordering::SeqCst);
            if eval_id != 0 {
                self.shared.http.ledger().finish_eval(eval_id);
            }
            drop(runtime);
        }
        self.state = SandboxState::Disposed;
    }
}

/// Evaluate the fragment and drive any returned promise to settlement.
async fn run_fragment<'js>(ctx: &Ctx<'js>, code: &str) -> Result<Option<JsonValue>> {
    let mut options = EvalOptions::default();
    options.promise = true;
    options.strict = false;

    let evaluated = ctx
        .eval_with_options::<Value, _>(code, options)
        .catch(ctx)
        .map_err(|caught| SandboxError::User(caught_message(ctx, &caught)))?;

    let settled = if let Some(promise) = evaluated.as_promise() {
        promise
            .clone()
            .into_future::<Value>()
            .await
            .catch(ctx)
            .map_err(|caught| SandboxError::User(caught_message(ctx, &caught)))?
    } else {
        evaluated
    };

    Ok(decode_value(ctx, &settled))
}

fn install_capabilities<'js>(
    ctx: &Ctx<'js>,
    shared: Arc<EvalShared>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let console = Object::new(ctx.clone())?;
    let log_shared = shared.clone();
    console.set(
        "log",
        Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
            let mut parts = Vec::with_capacity(args.len());
            for value in args.iter() {
                parts.push(console_form(decode_value(&ctx, value).as_ref()));
            }
            log_shared.push_line(parts.join(" "));
        }),
    )?;
    globals.set("console", console)?;

    let fetch_shared = shared.clone();
    globals.set(
        "__host_fetch",
        Func::from(Async(move |url: String| {
            let shared = fetch_shared.clone();
            async move {
                let principal = shared.principal();
                let eval_id = shared.eval_id.load(Ordering::SeqCst);
                encode_outcome(shared.http.get(&principal, eval_id, &url).await)
            }
        })),
    )?;

    let post_shared = shared.clone();
    globals.set(
        "__host_post",
        Func::from(Async(move |url: String, body: String| {
            let shared = post_shared.clone();
            async move {
                let principal = shared.principal();
                let eval_id = shared.eval_id.load(Ordering::SeqCst);
                encode_outcome(shared.http.post_form(&principal, eval_id, &url, &body).await)
            }
        })),
    )?;

    ctx.eval::<(), _>(PRELUDE)?;
    Ok(())
}

/// Envelope a mediated HTTP outcome as JSON for the prelude to unwrap.
fn encode_outcome(outcome: Result<HttpResponse>) -> String {
    match outcome {
        Ok(response) => {
            let headers: serde_json::Map<String, JsonValue> = response
                .headers
                .into_iter()
                .map(|(name, value)| (name, JsonValue::String(value)))
                .collect();
            serde_json::json!({
                "status": response.status,
                "statusText": response.status_text,
                "headers": headers,
                "body": response.body,
            })
            .to_string()
        }
        Err(error) => serde_json::json!({ "error": error.to_string() }).to_string(),
    }
}

fn caught_message(ctx: &Ctx<'_>, caught: &CaughtError<'_>) -> String {
    match caught {
        CaughtError::Exception(exception) => exception
            .message()
            .unwrap_or_else(|| "unknown error".to_string()),
        CaughtError::Value(value) => match decode_value(ctx, value) {
            Some(JsonValue::String(text)) => text,
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        },
        CaughtError::Error(error) => error.to_string(),
    }
}

fn is_resource_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("out of memory")
        || message.contains("stack overflow")
        || message.contains("memory limit")
}

fn engine_error(error: rquickjs::Error) -> SandboxError {
    SandboxError::Engine(error.to_string())
}
