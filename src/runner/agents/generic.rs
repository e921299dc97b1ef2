//! Generic agent adapter.
//!
//! Runs any command-line agent. Arguments are templated with the prompt file,
//! workspace, model and capabilities file of the current run.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{AgentAdapter, AgentRequest};
use crate::config::AgentSettings;
use crate::runner::process::{run_supervised, ProcessOutcome};
use crate::shutdown::Shutdown;

/// Generic adapter that works with any CLI-based agent.
pub struct GenericAdapter {
    /// Base command to run.
    command: String,
    /// Arguments template.
    args: Vec<String>,
}

impl GenericAdapter {
    /// Creates a new generic adapter with the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Creates with custom arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.command.clone()).with_args(settings.args.clone())
    }

    fn render_args(&self, request: &AgentRequest) -> Vec<String> {
        let model = request.model.as_deref().unwrap_or("");
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{prompt_file}", &request.prompt_file.to_string_lossy())
                    .replace("{workspace}", &request.workspace.to_string_lossy())
                    .replace("{model}", model)
                    .replace("{capabilities_file}", &request.capabilities_file.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl AgentAdapter for GenericAdapter {
    fn name(&self) -> &str {
        &self.command
    }

    async fn run(&self, request: &AgentRequest, cancel: &Shutdown) -> ProcessOutcome {
        let mut cmd = Command::new(&self.command);
        cmd.args(self.render_args(request));
        cmd.current_dir(&request.workspace);

        for (key, value) in request.env.iter().chain(request.capabilities.env.iter()) {
            cmd.env(key, value);
        }
        cmd.env("TIERBENCH_TIER", &request.tier_id)
            .env("TIERBENCH_SUBTEST", &request.subtest_id)
            .env("TIERBENCH_RUN", request.run_number.to_string())
            .env("TIERBENCH_PROMPT_FILE", &request.prompt_file)
            .env("TIERBENCH_CAPABILITIES_FILE", &request.capabilities_file);
        if let Some(model) = &request.model {
            cmd.env("TIERBENCH_MODEL", model);
        }

        info!(
            agent = %self.command,
            tier = %request.tier_id,
            subtest = %request.subtest_id,
            run = request.run_number,
            workspace = %request.workspace.display(),
            "Starting agent"
        );

        run_supervised(cmd, request.timeout, cancel).await
    }
}
