//! Build/lint/test pipeline execution.
//!
//! The same routine captures the baseline (before any agent change) and the
//! post-agent snapshot, so the two results are directly comparable.

use std::path::Path;

use tracing::{debug, info};

use super::result::{BuildPipelineResult, Stage, StageResult};
use crate::config::PipelineCommands;
use crate::error::PipelineError;
use crate::runner::process::{run_supervised, shell_command};
use crate::shutdown::Shutdown;
use crate::utils::tail;

/// Maximum characters of stage output kept per stage.
const MAX_STAGE_OUTPUT: usize = 8000;

/// Runs the configured pipeline against a workspace.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    commands: PipelineCommands,
}

impl PipelineRunner {
    pub fn new(commands: PipelineCommands) -> Self {
        Self { commands }
    }

    fn command_for(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Build => self.commands.build.as_deref(),
            Stage::Lint => self.commands.lint.as_deref(),
            Stage::Test => self.commands.test.as_deref(),
        }
        .filter(|c| !c.trim().is_empty())
    }

    /// Runs every stage in order.
    ///
    /// Later stages still run after an earlier one fails, so the baseline and
    /// post snapshots always cover the same stages.
    pub async fn run(&self, workspace: &Path, cancel: &Shutdown) -> Result<BuildPipelineResult, PipelineError> {
        let mut stages = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            let Some(command) = self.command_for(stage) else {
                stages.push(StageResult::skipped(stage));
                continue;
            };

            debug!(stage = %stage, command = %command, workspace = %workspace.display(), "Running pipeline stage");
            let outcome = run_supervised(shell_command(command, workspace), self.commands.timeout(), cancel).await;
            if outcome.cancelled {
                return Err(PipelineError::Cancelled);
            }

            let mut output = outcome.combined_output();
            if let Some(err) = &outcome.spawn_error {
                output = format!("failed to start: {err}");
            } else if outcome.timed_out {
                output.push_str(&format!("\n[timed out after {}s]", self.commands.timeout_secs));
            }

            stages.push(StageResult {
                stage,
                command: Some(command.to_string()),
                exit_code: outcome.exit_code,
                passed: outcome.success(),
                timed_out: outcome.timed_out,
                skipped: false,
                output: tail(output.trim_end(), MAX_STAGE_OUTPUT),
            });
        }

        let result = BuildPipelineResult::new(stages);
        info!(
            workspace = %workspace.display(),
            all_passed = result.all_passed,
            "Pipeline captured"
        );
        Ok(result)
    }
}
