//! Command-line interface for tierbench.
//!
//! Provides commands to run, resume and inspect tiered benchmark
//! experiments.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
