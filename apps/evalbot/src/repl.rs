//! Line-oriented REPL over the sandbox.
//!
//! Every line runs in a fresh sandbox under the `"default"` principal
//! with the same budgets as the bot, minus the grapheme truncation.

use std::sync::Arc;

use anyhow::Result;
use sandbox::{HttpBudgetLedger, Sandbox};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::command::format_result;
use crate::config::Config;

/// Ledger key for local evaluations.
pub const REPL_PRINCIPAL: &str = "default";

pub async fn run(config: Config) -> Result<()> {
    let ledger = Arc::new(HttpBudgetLedger::new(config.http_budget.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let mut sandbox = Sandbox::new(config.sandbox.clone(), Arc::clone(&ledger)).await?;
        let outcome = sandbox.execute(line, REPL_PRINCIPAL).await;
        sandbox.dispose().await;

        stdout.write_all(format_result(&outcome).as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    Ok(())
}
