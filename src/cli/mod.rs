//! Command-line interface for the sandbox worker.
//!
//! Provides commands for running against a remote queue, running local task
//! files on the mock engine, and checking configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, usage_exit_code, Cli, Commands};
