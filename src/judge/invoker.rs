//! Judge invocation.
//!
//! A judge is an external process that reads the prompt file and prints a
//! verdict. [`JudgeInvoker`] is the seam the consensus engine calls through,
//! so tests can substitute in-process judges.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::JudgeSettings;
use crate::error::JudgeError;
use crate::rate_limit::detect_rate_limit;
use crate::runner::process::run_supervised;
use crate::shutdown::Shutdown;
use crate::utils::{tail, try_extract_json_object};

/// Prompt and location shared by every judge of one run.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub prompt: String,
    pub prompt_file: PathBuf,
    /// Working directory of the judge; it inspects files here.
    pub workspace: PathBuf,
}

#[async_trait]
pub trait JudgeInvoker: Send + Sync {
    /// Runs one judge and returns its raw output.
    ///
    /// Must return [`JudgeError::RateLimited`] for quota signals and only
    /// for those.
    async fn invoke(&self, model: &str, request: &JudgeRequest, cancel: &Shutdown) -> Result<String, JudgeError>;
}

/// Judge backed by a command-line tool.
#[derive(Debug, Clone)]
pub struct ProcessJudge {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessJudge {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn from_settings(settings: &JudgeSettings) -> Self {
        Self::new(settings.command.clone(), settings.timeout()).with_args(settings.args.clone())
    }

    fn render_args(&self, model: &str, request: &JudgeRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", model)
                    .replace("{prompt_file}", &request.prompt_file.to_string_lossy())
                    .replace("{workspace}", &request.workspace.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl JudgeInvoker for ProcessJudge {
    async fn invoke(&self, model: &str, request: &JudgeRequest, cancel: &Shutdown) -> Result<String, JudgeError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(self.render_args(model, request))
            .current_dir(&request.workspace)
            .env("TIERBENCH_JUDGE_MODEL", model)
            .env("TIERBENCH_PROMPT_FILE", &request.prompt_file);

        debug!(judge = model, command = %self.command, "Invoking judge");
        let outcome = run_supervised(cmd, self.timeout, cancel).await;

        if outcome.cancelled {
            return Err(JudgeError::Cancelled);
        }
        if let Some(err) = outcome.spawn_error {
            return Err(JudgeError::Spawn(err));
        }
        if outcome.timed_out {
            return Err(JudgeError::Timeout {
                seconds: self.timeout.as_secs(),
            });
        }

        if !outcome.success() {
            let signal = detect_rate_limit(&outcome.stderr)
                .or_else(|| detect_rate_limit(&tail(&outcome.stdout, 4000)));
            return Err(match signal {
                Some(signal) => JudgeError::RateLimited(signal),
                None => JudgeError::ProcessFailed {
                    exit_code: outcome.exit_code,
                    stderr: tail(outcome.stderr.trim(), 2000),
                },
            });
        }

        // A clean exit that printed only a quota message is still rate limited.
        if try_extract_json_object(&outcome.stdout).is_err() {
            if let Some(signal) = detect_rate_limit(&outcome.combined_output()) {
                return Err(JudgeError::RateLimited(signal));
            }
        }

        Ok(outcome.stdout)
    }
}
