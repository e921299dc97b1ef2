//! Agent executor - supervises one agent run end to end.
//!
//! Writes the prompt and capability files into the run directory, invokes the
//! adapter under the agent rate-limit policy, persists the transcript and
//! extracts token and cost usage from the agent's JSON output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use super::agents::{AgentAdapter, AgentRequest};
use super::process::ProcessOutcome;
use super::result::{AgentExecution, ExecutionInfo, TokenStats};
use crate::config::{AgentSettings, CapabilityBundle};
use crate::error::AgentError;
use crate::rate_limit::{detect_rate_limit, Attempt, RateLimitSource, RateLimitTracker};
use crate::shutdown::Shutdown;
use crate::utils::{last_json_line, tail, try_extract_json_object};

/// Identity and inputs of one run.
#[derive(Debug, Clone)]
pub struct AgentRun<'a> {
    pub tier_id: &'a str,
    pub subtest_id: &'a str,
    pub run_number: u32,
    pub task: &'a str,
    pub capabilities: &'a CapabilityBundle,
    pub workspace: &'a Path,
    /// Directory receiving prompt, capabilities and transcript files.
    pub run_dir: &'a Path,
}

/// Supervises the external coding agent.
pub struct AgentExecutor {
    adapter: Arc<dyn AgentAdapter>,
    settings: AgentSettings,
    rate_limits: Arc<RateLimitTracker>,
}

impl AgentExecutor {
    pub fn new(adapter: Arc<dyn AgentAdapter>, settings: AgentSettings, rate_limits: Arc<RateLimitTracker>) -> Self {
        Self {
            adapter,
            settings,
            rate_limits,
        }
    }

    /// Runs the agent once.
    ///
    /// Timeouts, crashes and non-zero exits come back as a well-formed
    /// [`AgentExecution`]. Only cancellation, exhausted rate-limit retries and
    /// failure to prepare the run directory are errors.
    pub async fn execute(&self, run: &AgentRun<'_>, cancel: &Shutdown) -> Result<AgentExecution, AgentError> {
        tokio::fs::create_dir_all(run.run_dir).await?;

        let prompt = render_prompt(run.task, run.capabilities);
        let prompt_file = run.run_dir.join("prompt.md");
        let capabilities_file = run.run_dir.join("capabilities.json");
        tokio::fs::write(&prompt_file, &prompt).await?;
        tokio::fs::write(&capabilities_file, serde_json::to_vec_pretty(run.capabilities)?).await?;

        let request = AgentRequest {
            tier_id: run.tier_id.to_string(),
            subtest_id: run.subtest_id.to_string(),
            run_number: run.run_number,
            prompt,
            prompt_file: absolute(&prompt_file),
            capabilities: run.capabilities.clone(),
            capabilities_file: absolute(&capabilities_file),
            workspace: run.workspace.to_path_buf(),
            model: self.settings.model.clone(),
            timeout: self.settings.timeout(),
            env: self.settings.env.clone(),
        };

        let adapter = &self.adapter;
        let request = &request;
        let retried = self
            .rate_limits
            .retry_rate_limited(RateLimitSource::Agent, cancel, move || async move {
                let outcome = adapter.run(request, cancel).await;
                match agent_rate_limit_signal(&outcome) {
                    Some(signal) => Attempt::RateLimited(signal),
                    None => Attempt::Done(outcome),
                }
            })
            .await?;

        let outcome = retried.value;
        if outcome.cancelled {
            return Err(AgentError::Cancelled);
        }

        write_transcript(run.run_dir, &outcome).await?;

        if outcome.timed_out {
            warn!(
                tier = run.tier_id,
                subtest = run.subtest_id,
                run = run.run_number,
                timeout_secs = self.settings.timeout_secs,
                "Agent timed out"
            );
        }
        if let Some(err) = &outcome.spawn_error {
            warn!(agent = self.adapter.name(), error = %err, "Agent failed to start");
        }

        let (tokens, cost_usd) = parse_usage(&outcome.stdout);

        info!(
            tier = run.tier_id,
            subtest = run.subtest_id,
            run = run.run_number,
            exit_code = outcome.exit_code,
            duration_secs = outcome.duration.as_secs_f64(),
            cost_usd,
            "Agent finished"
        );

        Ok(AgentExecution {
            info: ExecutionInfo {
                exit_code: outcome.exit_code,
                duration_seconds: outcome.duration.as_secs_f64(),
                timed_out: outcome.timed_out,
            },
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            spawn_error: outcome.spawn_error,
            tokens,
            cost_usd,
            rate_limit: retried.rate_limit,
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Rate-limit signal from a failed agent run. Successful runs are never
/// treated as rate limited, whatever they printed.
fn agent_rate_limit_signal(outcome: &ProcessOutcome) -> Option<String> {
    if outcome.success() || outcome.timed_out || outcome.cancelled || outcome.spawn_error.is_some() {
        return None;
    }
    detect_rate_limit(&outcome.stderr).or_else(|| detect_rate_limit(&tail(&outcome.stdout, 4000)))
}

/// Builds the prompt file handed to the agent.
pub fn render_prompt(task: &str, capabilities: &CapabilityBundle) -> String {
    let mut prompt = String::new();
    if let Some(system) = &capabilities.system_prompt {
        prompt.push_str(system.trim_end());
        prompt.push_str("\n\n");
    }
    prompt.push_str("# Task\n\n");
    prompt.push_str(task.trim_end());
    prompt.push('\n');

    let sections = [
        ("Skills", &capabilities.skills),
        ("Tools", &capabilities.tools),
        ("Sub-agents", &capabilities.sub_agents),
    ];
    if sections.iter().any(|(_, items)| !items.is_empty()) {
        prompt.push_str("\n## Available capabilities\n");
        for (label, items) in sections {
            if !items.is_empty() {
                prompt.push_str(&format!("\n{label}: {}\n", items.join(", ")));
            }
        }
    }
    prompt
}

async fn write_transcript(run_dir: &Path, outcome: &ProcessOutcome) -> Result<(), AgentError> {
    tokio::fs::write(run_dir.join("stdout.log"), &outcome.stdout).await?;
    tokio::fs::write(run_dir.join("stderr.log"), &outcome.stderr).await?;
    Ok(())
}

fn u64_field(map: &Map<String, Value>, key: &str) -> u64 {
    map.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn usage_object(stdout: &str) -> Option<Map<String, Value>> {
    let has_usage = |m: &Map<String, Value>| {
        ["total_cost_usd", "cost_usd", "usage"]
            .iter()
            .any(|k| m.get(*k).is_some_and(|v| !v.is_null()))
    };
    last_json_line(stdout)
        .filter(has_usage)
        .or_else(|| try_extract_json_object(stdout).ok().filter(has_usage))
}

/// Extracts token usage and cost from agent output. Missing or null fields
/// count as zero.
pub fn parse_usage(stdout: &str) -> (TokenStats, f64) {
    let Some(obj) = usage_object(stdout) else {
        return (TokenStats::default(), 0.0);
    };

    let cost = ["total_cost_usd", "cost_usd"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_f64))
        .filter(|c| c.is_finite() && *c >= 0.0)
        .unwrap_or(0.0);

    let tokens = match obj.get("usage").and_then(Value::as_object) {
        Some(usage) => TokenStats {
            input_tokens: u64_field(usage, "input_tokens"),
            output_tokens: u64_field(usage, "output_tokens"),
            cache_read_tokens: u64_field(usage, "cache_read_input_tokens"),
            cache_creation_tokens: u64_field(usage, "cache_creation_input_tokens"),
        },
        None => TokenStats::default(),
    };

    (tokens, cost)
}
