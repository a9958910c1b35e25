//! Firehose-driven code evaluation bot.
//!
//! Mentions flow from the Jetstream subscription through admission
//! control into a sandboxed evaluation, and the formatted result is
//! posted back into the thread.

pub mod admission;
pub mod bot;
pub mod client;
pub mod command;
pub mod config;
pub mod metrics;
pub mod repl;
pub mod worker;
