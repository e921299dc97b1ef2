//! Error types for tierbench operations.
//!
//! Defines error types for each subsystem of the harness:
//! - Experiment configuration loading and validation
//! - Workspace isolation (git worktree lifecycle)
//! - Build/lint/test pipeline capture
//! - Agent and judge subprocess invocation
//! - Judge consensus reconciliation
//! - Checkpoint persistence and resume
//! - Tier orchestration
//!
//! Execution faults (non-zero exits, timeouts, malformed judge output) are
//! recorded on result records rather than raised. The variants here cover the
//! conditions that genuinely stop a unit of work.

use std::path::PathBuf;

use thiserror::Error;

use crate::rate_limit::RateLimitInfo;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid {field} '{value}': {reason}")]
    InvalidIdentifier {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while acquiring or releasing an isolated workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Workspace identifier '{identifier}' collides with an existing reference: {reason}")]
    IdentifierCollision { identifier: String, reason: String },

    #[error("Invalid workspace identifier component: {0}")]
    InvalidComponent(#[from] ConfigError),

    #[error("Base repository '{0}' is not a git repository")]
    NotARepository(PathBuf),

    #[error("Failed to create workspace '{identifier}': {stderr}")]
    CreateFailed { identifier: String, stderr: String },

    #[error("Failed to remove workspace '{identifier}': {stderr}")]
    CleanupFailed { identifier: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while capturing a build pipeline snapshot.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Pipeline capture cancelled")]
    Cancelled,
}

/// Errors surfaced by rate-limit backoff.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    #[error("{} rate limit retries exhausted after {} attempts: {}", .0.source, .0.retry_count, .0.last_signal)]
    Exhausted(RateLimitInfo),

    #[error("Rate limit backoff cancelled")]
    Cancelled,
}

/// Errors that can occur while invoking the agent under test.
///
/// Timeouts and non-zero exits are not errors; they are reported on
/// [`crate::runner::ExecutionInfo`].
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent rate limit retries exhausted after {} attempts", .0.retry_count)]
    RateLimited(RateLimitInfo),

    #[error("Agent configuration error: {0}")]
    Config(String),

    #[error("Agent run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RateLimitError> for AgentError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::Exhausted(info) => AgentError::RateLimited(info),
            RateLimitError::Cancelled => AgentError::Cancelled,
        }
    }
}

/// Errors from a single judge invocation.
///
/// Every variant except [`JudgeError::RateLimited`] turns into an invalid vote.
#[derive(Debug, Clone, Error)]
pub enum JudgeError {
    #[error("Judge rate limited: {0}")]
    RateLimited(String),

    #[error("Judge timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Judge process exited with code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },

    #[error("Failed to start judge: {0}")]
    Spawn(String),

    #[error("Judge invocation cancelled")]
    Cancelled,

    #[error("Judge IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for JudgeError {
    fn from(e: std::io::Error) -> Self {
        JudgeError::Io(e.to_string())
    }
}

/// Errors that stop consensus reconciliation for a run.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Judge rate limit retries exhausted after {} attempts", .0.retry_count)]
    RateLimited(RateLimitInfo),

    #[error("No judges configured")]
    NoJudges,

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Failed to write judge files: {0}")]
    Io(#[from] std::io::Error),

    #[error("Judging cancelled")]
    Cancelled,
}

impl From<RateLimitError> for ConsensusError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::Exhausted(info) => ConsensusError::RateLimited(info),
            RateLimitError::Cancelled => ConsensusError::Cancelled,
        }
    }
}

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint belongs to a different configuration (expected digest {expected}, found {found})")]
    ConfigMismatch { expected: String, found: String },

    #[error("Checkpoint for experiment '{found}' cannot resume experiment '{expected}'")]
    ExperimentMismatch { expected: String, found: String },

    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to publish checkpoint {path}: {reason}")]
    Publish { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that fail an entire tier.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("Baseline capture failed for subtest '{subtest}': {source}")]
    Baseline {
        subtest: String,
        #[source]
        source: PipelineError,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Every run in tier '{tier}' failed ({failed} framework errors)")]
    AllRunsFailed { tier: String, failed: usize },

    #[error("Tier task panicked: {0}")]
    Panicked(String),

    #[error("Tier cancelled")]
    Cancelled,
}

/// Errors that fail the whole experiment.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("All {} tiers failed: {}", .0.len(), summarize_failures(.0))]
    AllTiersFailed(Vec<(String, String)>),

    #[error("No tiers selected to run")]
    NothingToRun,

    #[error("Experiment cancelled; completed work is checkpointed")]
    Cancelled,
}

fn summarize_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(tier, reason)| format!("{tier}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}
