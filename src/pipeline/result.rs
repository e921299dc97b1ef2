//! Build pipeline snapshots and baseline/post comparison.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One step of the fixed build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Lint,
    Test,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Build, Stage::Lint, Stage::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Lint => "lint",
            Stage::Test => "test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single stage.
///
/// Carries no timing information, so recapturing an unchanged workspace
/// serializes to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub command: Option<String>,
    pub exit_code: i32,
    pub passed: bool,
    pub timed_out: bool,
    /// No command configured for this stage.
    pub skipped: bool,
    pub output: String,
}

impl StageResult {
    pub fn skipped(stage: Stage) -> Self {
        Self {
            stage,
            command: None,
            exit_code: 0,
            passed: true,
            timed_out: false,
            skipped: true,
            output: String::new(),
        }
    }

    fn status_label(&self) -> &'static str {
        if self.skipped {
            "SKIPPED"
        } else if self.timed_out {
            "TIMED OUT"
        } else if self.passed {
            "PASSED"
        } else {
            "FAILED"
        }
    }
}

/// Immutable build/lint/test snapshot of one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPipelineResult {
    pub stages: Vec<StageResult>,
    pub all_passed: bool,
}

impl BuildPipelineResult {
    pub fn new(stages: Vec<StageResult>) -> Self {
        let all_passed = stages.iter().all(|s| s.passed);
        Self { stages, all_passed }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// SHA-256 of the canonical JSON form.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Plain-text rendering embedded in judge prompts.
    pub fn to_judge_text(&self) -> String {
        let mut text = String::new();
        for stage in &self.stages {
            text.push_str(&format!("### {}: {}\n", stage.stage, stage.status_label()));
            if let Some(cmd) = &stage.command {
                text.push_str(&format!("Command: `{}` (exit code {})\n", cmd, stage.exit_code));
            }
            if !stage.output.trim().is_empty() {
                text.push_str("```\n");
                text.push_str(stage.output.trim_end());
                text.push_str("\n```\n");
            }
            text.push('\n');
        }
        text
    }
}

/// How a stage changed between baseline and post-agent capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDelta {
    /// Passed before, fails after: the agent broke it.
    Regression,
    /// Failed before and after: not the agent's fault.
    PreExisting,
    /// Failed before, passes after.
    Improvement,
    StillPassing,
    /// Skipped in either snapshot.
    NotRun,
}

impl StageDelta {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageDelta::Regression => "REGRESSION",
            StageDelta::PreExisting => "PRE-EXISTING FAILURE",
            StageDelta::Improvement => "IMPROVEMENT",
            StageDelta::StillPassing => "still passing",
            StageDelta::NotRun => "not run",
        }
    }
}

/// Per-stage classification of a baseline/post pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineComparison {
    pub stages: Vec<(Stage, StageDelta)>,
}

impl PipelineComparison {
    pub fn between(baseline: &BuildPipelineResult, post: &BuildPipelineResult) -> Self {
        let stages = Stage::ALL
            .iter()
            .map(|&stage| {
                let delta = match (baseline.stage(stage), post.stage(stage)) {
                    (Some(before), Some(after)) if !before.skipped && !after.skipped => {
                        match (before.passed, after.passed) {
                            (true, false) => StageDelta::Regression,
                            (false, false) => StageDelta::PreExisting,
                            (false, true) => StageDelta::Improvement,
                            (true, true) => StageDelta::StillPassing,
                        }
                    }
                    _ => StageDelta::NotRun,
                };
                (stage, delta)
            })
            .collect();
        Self { stages }
    }

    pub fn delta(&self, stage: Stage) -> StageDelta {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, d)| *d)
            .unwrap_or(StageDelta::NotRun)
    }

    pub fn has_regression(&self) -> bool {
        self.stages.iter().any(|(_, d)| *d == StageDelta::Regression)
    }

    pub fn to_judge_text(&self) -> String {
        self.stages
            .iter()
            .map(|(stage, delta)| format!("- {}: {}\n", stage, delta.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(stage: Stage, passed: bool) -> StageResult {
        StageResult {
            stage,
            command: Some("true".to_string()),
            exit_code: if passed { 0 } else { 1 },
            passed,
            timed_out: false,
            skipped: false,
            output: String::new(),
        }
    }

    #[test]
    fn test_comparison_classification() {
        let baseline = BuildPipelineResult::new(vec![
            stage(Stage::Build, true),
            stage(Stage::Lint, false),
            stage(Stage::Test, false),
        ]);
        let post = BuildPipelineResult::new(vec![
            stage(Stage::Build, false),
            stage(Stage::Lint, false),
            stage(Stage::Test, true),
        ]);

        let cmp = PipelineComparison::between(&baseline, &post);
        assert_eq!(cmp.delta(Stage::Build), StageDelta::Regression);
        assert_eq!(cmp.delta(Stage::Lint), StageDelta::PreExisting);
        assert_eq!(cmp.delta(Stage::Test), StageDelta::Improvement);
        assert!(cmp.has_regression());
    }

    #[test]
    fn test_skipped_stage_is_not_run() {
        let baseline = BuildPipelineResult::new(vec![StageResult::skipped(Stage::Lint)]);
        let post = BuildPipelineResult::new(vec![StageResult::skipped(Stage::Lint)]);
        let cmp = PipelineComparison::between(&baseline, &post);
        assert_eq!(cmp.delta(Stage::Lint), StageDelta::NotRun);
        assert_eq!(cmp.delta(Stage::Build), StageDelta::NotRun);
        assert!(!cmp.has_regression());
    }

    #[test]
    fn test_all_passed_and_digest() {
        let a = BuildPipelineResult::new(vec![stage(Stage::Build, true), stage(Stage::Test, false)]);
        assert!(!a.all_passed);
        let b = a.clone();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_judge_text_marks_failures() {
        let result = BuildPipelineResult::new(vec![StageResult {
            output: "error[E0308]: mismatched types".to_string(),
            ..stage(Stage::Build, false)
        }]);
        let text = result.to_judge_text();
        assert!(text.contains("build: FAILED"));
        assert!(text.contains("E0308"));
    }
}
