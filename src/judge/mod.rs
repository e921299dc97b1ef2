//! Rubric-based judging with multi-judge consensus.
//!
//! # Architecture
//!
//! ```text
//! JudgeContext → judge_prompt.md → N × JudgeInvoker → parse_verdict → reconcile
//!                                       ↑ rate-limit backoff (judge source)
//! ```
//!
//! - **Rubric** (`rubric`): checklist and subjective categories, N/A handling,
//!   grade scale, stage overrides from the baseline/post comparison
//! - **Prompt** (`prompt`): the single prompt every judge of a run receives
//! - **Invoker** (`invoker`): the process boundary to a judge executable
//! - **Parse** (`parse`): tolerant extraction of a vote from free-form output
//! - **Consensus** (`consensus`): bounded rounds and vote reconciliation
//!
//! # Example
//!
//! ```ignore
//! use tierbench::judge::{JudgeConsensusEngine, JudgeInput, ProcessJudge};
//!
//! let engine = JudgeConsensusEngine::new(
//!     Arc::new(ProcessJudge::from_settings(&config.judge)),
//!     config.judge.clone(),
//!     Arc::new(config.rubric()?.clone()),
//!     rate_limits,
//! );
//! let request = engine.prepare(&context, workspace.path(), &run_dir).await?;
//! let judgment = engine
//!     .judge(JudgeInput { request: &request, comparison: &comparison, log_dir: &run_dir }, None, &cancel)
//!     .await?;
//! ```

pub mod consensus;
pub mod invoker;
pub mod parse;
pub mod prompt;
pub mod rubric;

pub use consensus::{JudgeConsensusEngine, JudgeInput, RoundCheckpoint};
pub use invoker::{JudgeInvoker, JudgeRequest, ProcessJudge};
pub use parse::{parse_verdict, JudgeResultSummary};
pub use prompt::JudgeContext;
pub use rubric::{
    Anchor, CategoryScores, GradeBand, GradeScale, ItemScore, Rubric, RubricCategory, RubricItem,
    ScoringType,
};
