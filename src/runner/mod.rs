//! Agent runner for tiered benchmark runs.
//!
//! This module runs the external coding agent against an isolated workspace
//! and records what happened.
//!
//! # Architecture
//!
//! ```text
//! prompt.md + capabilities.json → AgentAdapter → agent process → transcript + usage
//! ```
//!
//! The runner:
//! 1. Renders the task prompt with the tier's capability bundle
//! 2. Spawns the agent as a timeboxed subprocess in the workspace
//! 3. Retries on rate-limit signals with exponential backoff
//! 4. Records exit status, duration, token usage and cost

pub mod agents;
pub mod executor;
pub mod process;
pub mod result;

pub use agents::{AgentAdapter, AgentRequest, GenericAdapter};
pub use executor::{parse_usage, render_prompt, AgentExecutor, AgentRun};
pub use process::{run_supervised, shell_command, ProcessOutcome};
pub use result::{AgentExecution, ExecutionInfo, JudgmentInfo, RunResult, TokenStats};
