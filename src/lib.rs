//! tierbench: tiered benchmarking harness for autonomous coding agents.
//!
//! This library runs an external coding agent under several capability
//! tiers in isolated git worktrees, grades each run with a panel of judges
//! against a rubric and baseline/post build pipeline snapshots, and folds the
//! results into pass rate and Cost-of-Pass per subtest and tier. Every unit
//! of work is checkpointed so interrupted experiments resume where they
//! stopped.

// Core modules
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod judge;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod utils;
pub mod workspace;

// Re-export commonly used error types
pub use error::{
    AgentError, CheckpointError, ConfigError, ConsensusError, JudgeError, OrchestratorError,
    PipelineError, TierError, WorkspaceError,
};
