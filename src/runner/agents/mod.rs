//! Adapters for launching the agent under test.
//!
//! Each adapter knows how to:
//! 1. Launch the agent against a workspace with a file-based prompt
//! 2. Capture its output
//! 3. Honour the timeout and cancellation signal
//!
//! Adapters never fail: spawn errors, crashes and timeouts are reported on
//! the returned [`ProcessOutcome`].

pub mod generic;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CapabilityBundle;
use crate::runner::process::ProcessOutcome;
use crate::shutdown::Shutdown;

pub use generic::GenericAdapter;

/// Everything an adapter needs for one invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub tier_id: String,
    pub subtest_id: String,
    pub run_number: u32,
    /// Rendered prompt, also written to `prompt_file`.
    pub prompt: String,
    pub prompt_file: PathBuf,
    pub capabilities: CapabilityBundle,
    /// JSON rendering of `capabilities`.
    pub capabilities_file: PathBuf,
    /// Isolated worktree the agent works in.
    pub workspace: PathBuf,
    pub model: Option<String>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

/// Trait for agent adapters.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Runs the agent once.
    async fn run(&self, request: &AgentRequest, cancel: &Shutdown) -> ProcessOutcome;
}
