//! Command-line interface for swe-runner.
//!
//! Provides commands for running an agent over SWE-bench, evaluating the
//! resulting predictions and inspecting retrieval output.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
