//! Command-line interface for agentpool.
//!
//! Provides commands for running the orchestration engine, submitting
//! tasks, inspecting stats, and recovering in-flight work.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
