//! Judge prompt assembly.
//!
//! Every judge of a run receives the same prompt: task, rubric, both pipeline
//! snapshots with their stage-by-stage comparison, an excerpt of the agent
//! transcript and the expanded file listing of the workspace.

use super::rubric::{Rubric, ScoringType};
use crate::pipeline::{BuildPipelineResult, PipelineComparison};
use crate::utils::tail;
use crate::workspace::FileListing;

/// Characters of agent transcript included in the prompt.
const TRANSCRIPT_EXCERPT_CHARS: usize = 12_000;

/// Grading instructions placed before the run-specific sections.
const JUDGE_INSTRUCTIONS: &str = r#"You are an expert code reviewer grading the work of an AI coding agent.

## YOUR ROLE

The agent was given the task below and worked in the repository that is your
current working directory. Inspect the files to verify its claims. Do NOT
modify any file.

## REGRESSION-AWARE GRADING

The build pipeline ran before the agent started (baseline) and after it
finished (post). Classify every failure:
- **REGRESSION** (passed before, fails after): the agent broke it. Penalize heavily.
- **PRE-EXISTING FAILURE** (failed before and after): not the agent's fault.
  Mark related rubric items "N/A" and do not penalize.
- **IMPROVEMENT** (failed before, passes after): credit positively.

## SCORING

Score every rubric item. Checklist items take any value from 0 up to their
max points, fractions allowed. Subjective categories use their anchors as
reference levels. Use "N/A" only for items that genuinely do not apply."#;

const OUTPUT_FORMAT: &str = r#"## OUTPUT FORMAT

Respond with a single JSON object:
{
  "score": 0.0-1.0,
  "passed": true|false,
  "grade": "letter grade from the scale above",
  "reasoning": "concise justification",
  "categories": {
    "<category name>": {"items": {"<item id>": <points or "N/A">}}
  }
}"#;

/// Everything a judge sees for one run.
#[derive(Debug, Clone, Copy)]
pub struct JudgeContext<'a> {
    pub task: &'a str,
    pub rubric: &'a Rubric,
    pub baseline: &'a BuildPipelineResult,
    pub post: &'a BuildPipelineResult,
    pub comparison: &'a PipelineComparison,
    pub transcript: &'a str,
    pub listing: &'a FileListing,
}

impl JudgeContext<'_> {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(16 * 1024);
        out.push_str(JUDGE_INSTRUCTIONS);
        out.push_str("\n\n## TASK\n\n");
        out.push_str(self.task.trim());
        out.push_str("\n\n");
        out.push_str(&render_rubric(self.rubric));
        out.push_str("## BASELINE PIPELINE (before the agent)\n\n");
        out.push_str(&self.baseline.to_judge_text());
        out.push_str("## POST PIPELINE (after the agent)\n\n");
        out.push_str(&self.post.to_judge_text());
        out.push_str("## STAGE COMPARISON\n\n");
        out.push_str(&self.comparison.to_judge_text());
        out.push_str("\n## AGENT TRANSCRIPT (excerpt)\n\n```\n");
        out.push_str(&tail(self.transcript.trim_end(), TRANSCRIPT_EXCERPT_CHARS));
        out.push_str("\n```\n\n## WORKSPACE FILES\n\n```\n");
        out.push_str(&self.listing.render());
        out.push_str("\n```\n\n");
        out.push_str(OUTPUT_FORMAT);
        out.push('\n');
        out
    }
}

fn render_rubric(rubric: &Rubric) -> String {
    let mut out = String::from("## RUBRIC\n\n");
    for category in &rubric.categories {
        let kind = match category.scoring_type {
            ScoringType::Checklist => "checklist",
            ScoringType::Subjective => "subjective",
        };
        out.push_str(&format!(
            "### {} ({}, weight {})\n",
            category.name, kind, category.weight
        ));
        for item in &category.items {
            out.push_str(&format!(
                "- `{}` (max {}): {}",
                item.id, item.max_points, item.description
            ));
            if let Some(stage) = item.stage {
                out.push_str(&format!(" [depends on {stage} stage]"));
            }
            out.push('\n');
        }
        if !category.anchors.is_empty() {
            out.push_str("Anchors:\n");
            for anchor in &category.anchors {
                out.push_str(&format!("  - {}: {}\n", anchor.score, anchor.description));
            }
        }
        out.push('\n');
    }

    out.push_str(&format!("Pass threshold: {}\n", rubric.pass_threshold));
    let grades: Vec<String> = rubric
        .grade_scale
        .0
        .iter()
        .map(|band| format!("{} >= {}", band.grade, band.min_score))
        .collect();
    out.push_str(&format!("Grade scale: {}\n\n", grades.join(", ")));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Stage, StageResult};

    const RUBRIC: &str = r#"
categories:
  - name: quality
    scoring_type: subjective
    items:
      - id: readability
        description: Code is readable
        max_points: 2.0
    anchors:
      - score: 0.0
        description: Unreadable
      - score: 2.0
        description: Exemplary
  - name: functional
    scoring_type: checklist
    items:
      - id: tests
        description: Tests pass
        stage: test
"#;

    #[test]
    fn test_render_contains_every_section() {
        let rubric = Rubric::from_yaml_str(RUBRIC).unwrap();
        let baseline = BuildPipelineResult::new(vec![StageResult {
            stage: Stage::Test,
            command: Some("make test".to_string()),
            exit_code: 1,
            passed: false,
            timed_out: false,
            skipped: false,
            output: "1 failed".to_string(),
        }]);
        let post = baseline.clone();
        let comparison = PipelineComparison::between(&baseline, &post);
        let listing = FileListing {
            files: vec!["src/lib.rs".to_string()],
            total: 3,
        };

        let prompt = JudgeContext {
            task: "Fix the parser",
            rubric: &rubric,
            baseline: &baseline,
            post: &post,
            comparison: &comparison,
            transcript: "agent says done",
            listing: &listing,
        }
        .render();

        assert!(prompt.contains("## TASK\n\nFix the parser"));
        assert!(prompt.contains("### quality (subjective, weight 1)"));
        assert!(prompt.contains("  - 2: Exemplary"));
        assert!(prompt.contains("[depends on test stage]"));
        assert!(prompt.contains("Pass threshold: 0.6"));
        assert!(prompt.contains("- test: PRE-EXISTING FAILURE"));
        assert!(prompt.contains("agent says done"));
        assert!(prompt.contains("src/lib.rs\n... 2 more files"));
        assert!(prompt.contains("## OUTPUT FORMAT"));
    }
}
