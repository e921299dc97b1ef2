//! Result records for agent runs.
//!
//! [`ExecutionInfo`] is the minimal persisted form shared by every execution
//! record; [`AgentExecution`] embeds it by value alongside the rich detail
//! that only lives in memory and in transcript files. [`RunResult`] is built
//! stage by stage through consuming `with_*` methods, each producing a new
//! value from the previous one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::judge::JudgeResultSummary;
use crate::rate_limit::RateLimitInfo;

/// Exit status, elapsed time and timeout flag of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Always set; -1 when the process was killed or never started.
    pub exit_code: i32,
    /// Zero until the execution finishes.
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecutionInfo {
    pub fn pending() -> Self {
        Self {
            exit_code: -1,
            duration_seconds: 0.0,
            timed_out: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

impl Default for ExecutionInfo {
    fn default() -> Self {
        Self::pending()
    }
}

/// Token usage reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl TokenStats {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }
}

/// Everything captured from one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentExecution {
    pub info: ExecutionInfo,
    pub stdout: String,
    pub stderr: String,
    pub spawn_error: Option<String>,
    pub tokens: TokenStats,
    pub cost_usd: f64,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Consensus verdict attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentInfo {
    pub score: f64,
    pub passed: bool,
    pub grade: String,
    /// Every vote cast, valid or not, across all rounds.
    pub votes: Vec<JudgeResultSummary>,
    pub rounds: u32,
    /// No valid vote was cast; score and verdict are the zero sentinel.
    #[serde(default)]
    pub degenerate: bool,
}

impl JudgmentInfo {
    pub fn valid_votes(&self) -> usize {
        self.votes.iter().filter(|v| v.is_valid).count()
    }

    /// Rate-limit episodes judges recovered from, one per affected vote.
    pub fn rate_limits(&self) -> impl Iterator<Item = &RateLimitInfo> {
        self.votes.iter().filter_map(|v| v.rate_limit.as_ref())
    }
}

/// One agent execution and its grading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub tier_id: String,
    pub subtest_id: String,
    pub run_number: u32,
    pub workspace_id: String,
    pub execution: ExecutionInfo,
    #[serde(default)]
    pub tokens: TokenStats,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub judgment: Option<JudgmentInfo>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitInfo>,
    /// Harness fault that prevented a meaningful outcome.
    #[serde(default)]
    pub framework_error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunResult {
    pub fn new(
        tier_id: impl Into<String>,
        subtest_id: impl Into<String>,
        run_number: u32,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            tier_id: tier_id.into(),
            subtest_id: subtest_id.into(),
            run_number,
            workspace_id: workspace_id.into(),
            execution: ExecutionInfo::pending(),
            tokens: TokenStats::default(),
            cost_usd: 0.0,
            judgment: None,
            rate_limit: None,
            framework_error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Records the agent execution, including any rate-limit episode.
    pub fn with_execution(self, execution: &AgentExecution) -> Self {
        Self {
            execution: execution.info,
            tokens: execution.tokens,
            cost_usd: execution.cost_usd,
            rate_limit: execution.rate_limit.clone().or(self.rate_limit),
            ..self
        }
    }

    pub fn with_judgment(self, judgment: JudgmentInfo) -> Self {
        Self {
            judgment: Some(judgment),
            ..self
        }
    }

    pub fn with_rate_limit(self, info: RateLimitInfo) -> Self {
        Self {
            rate_limit: Some(info),
            ..self
        }
    }

    pub fn with_framework_error(self, error: impl Into<String>) -> Self {
        Self {
            framework_error: Some(error.into()),
            ..self
        }
    }

    pub fn completed(self) -> Self {
        Self {
            completed_at: Some(Utc::now()),
            ..self
        }
    }

    /// Judged without a harness fault.
    pub fn is_complete(&self) -> bool {
        self.judgment.is_some() && self.framework_error.is_none()
    }

    pub fn passed(&self) -> bool {
        self.framework_error.is_none() && self.judgment.as_ref().is_some_and(|j| j.passed)
    }

    pub fn score(&self) -> f64 {
        self.judgment.as_ref().map(|j| j.score).unwrap_or(0.0)
    }

    /// Every rate-limit episode on this run: the agent's or an exhausted
    /// judge's first, then those judges recovered from.
    pub fn rate_limit_episodes(&self) -> impl Iterator<Item = &RateLimitInfo> {
        self.rate_limit
            .iter()
            .chain(self.judgment.iter().flat_map(|j| j.rate_limits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judgment(passed: bool) -> JudgmentInfo {
        JudgmentInfo {
            score: if passed { 0.9 } else { 0.2 },
            passed,
            grade: if passed { "A" } else { "D" }.to_string(),
            votes: Vec::new(),
            rounds: 1,
            degenerate: false,
        }
    }

    #[test]
    fn test_new_run_has_pending_execution() {
        let run = RunResult::new("T0", "00", 1, "ws");
        assert_eq!(run.execution.exit_code, -1);
        assert_eq!(run.execution.duration_seconds, 0.0);
        assert!(!run.is_complete());
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn test_copy_with_changes_preserves_fields() {
        let execution = AgentExecution {
            info: ExecutionInfo {
                exit_code: 0,
                duration_seconds: 12.5,
                timed_out: false,
            },
            stdout: String::new(),
            stderr: String::new(),
            spawn_error: None,
            tokens: TokenStats {
                input_tokens: 100,
                output_tokens: 50,
                ..Default::default()
            },
            cost_usd: 0.25,
            rate_limit: None,
        };

        let original = RunResult::new("T1", "02", 3, "ws-3");
        let started = original.started_at;
        let run = original.with_execution(&execution).with_judgment(judgment(true)).completed();

        assert_eq!(run.started_at, started);
        assert_eq!(run.tier_id, "T1");
        assert_eq!(run.tokens.total(), 150);
        assert_eq!(run.cost_usd, 0.25);
        assert!(run.passed());
        assert!(run.is_complete());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_framework_error_blocks_pass() {
        let run = RunResult::new("T0", "00", 1, "ws")
            .with_judgment(judgment(true))
            .with_framework_error("judge rate limit exhausted");
        assert!(!run.passed());
        assert!(!run.is_complete());
    }

    #[test]
    fn test_persisted_form_round_trips() {
        let run = RunResult::new("T0", "00", 1, "ws").with_judgment(judgment(false));
        let json = serde_json::to_string(&run).unwrap();
        let back: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(run, back);
    }
}
