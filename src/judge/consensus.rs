//! Consensus across independent judges.
//!
//! Each round invokes every configured judge concurrently. Votes accumulate
//! across rounds; a new round starts only while the latest round's valid
//! scores spread wider than `max_score_spread`, up to
//! [`JudgeSettings::effective_max_rounds`] rounds in total.
//!
//! Judge failures other than rate limits become invalid votes and are left
//! out of the consensus. When no valid vote exists the result is the
//! degenerate zero sentinel: score 0, not passed, lowest grade.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::invoker::{JudgeInvoker, JudgeRequest};
use super::parse::{parse_verdict, JudgeResultSummary};
use super::prompt::JudgeContext;
use super::rubric::Rubric;
use crate::checkpoint::{CheckpointManager, RunState};
use crate::config::{JudgeSettings, PassRule};
use crate::error::{ConsensusError, JudgeError};
use crate::metrics::MetricsCollector;
use crate::pipeline::PipelineComparison;
use crate::rate_limit::{Attempt, RateLimitSource, RateLimitTracker};
use crate::runner::{JudgmentInfo, RunResult};
use crate::shutdown::Shutdown;

/// Where to record per-round progress for a run.
#[derive(Debug, Clone, Copy)]
pub struct RoundCheckpoint<'a> {
    pub checkpoints: &'a CheckpointManager,
    pub run: &'a RunResult,
}

/// Inputs for judging one run.
#[derive(Debug, Clone, Copy)]
pub struct JudgeInput<'a> {
    pub request: &'a JudgeRequest,
    pub comparison: &'a PipelineComparison,
    /// Raw judge outputs are written here.
    pub log_dir: &'a Path,
}

pub struct JudgeConsensusEngine {
    invoker: Arc<dyn JudgeInvoker>,
    settings: JudgeSettings,
    rubric: Arc<Rubric>,
    rate_limits: Arc<RateLimitTracker>,
    metrics: MetricsCollector,
}

impl JudgeConsensusEngine {
    pub fn new(
        invoker: Arc<dyn JudgeInvoker>,
        settings: JudgeSettings,
        rubric: Arc<Rubric>,
        rate_limits: Arc<RateLimitTracker>,
    ) -> Self {
        Self {
            invoker,
            settings,
            rubric,
            rate_limits,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Renders the judge prompt into `run_dir` and builds the request.
    pub async fn prepare(
        &self,
        context: &JudgeContext<'_>,
        workspace: &Path,
        run_dir: &Path,
    ) -> Result<JudgeRequest, ConsensusError> {
        tokio::fs::create_dir_all(run_dir).await?;
        let prompt = context.render();
        let prompt_file = run_dir.join("judge_prompt.md");
        tokio::fs::write(&prompt_file, &prompt).await?;
        Ok(JudgeRequest {
            prompt,
            prompt_file,
            workspace: workspace.to_path_buf(),
        })
    }

    /// Runs judge rounds until the votes agree or the round bound is hit.
    pub async fn judge(
        &self,
        input: JudgeInput<'_>,
        progress: Option<RoundCheckpoint<'_>>,
        cancel: &Shutdown,
    ) -> Result<JudgmentInfo, ConsensusError> {
        if self.settings.models.is_empty() {
            return Err(ConsensusError::NoJudges);
        }

        let max_rounds = self.settings.effective_max_rounds();
        let mut votes = Vec::new();
        let mut round = 0;

        loop {
            round += 1;
            let round_votes = self.run_round(input, round, cancel).await?;
            let spread = score_spread(&round_votes);
            votes.extend(round_votes);
            let judgment = self.reconcile(&votes, round);

            if let Some(progress) = progress {
                let partial = progress.run.clone().with_judgment(judgment.clone());
                progress.checkpoints.save_run(RunState::Judging, &partial).await?;
            }

            let agreed = spread.map_or(true, |s| s <= self.settings.max_score_spread);
            if agreed || round >= max_rounds {
                if !agreed {
                    warn!(
                        rounds = round,
                        spread = spread.unwrap_or_default(),
                        "Judges still disagree after final round"
                    );
                }
                self.metrics.record_consensus_score(judgment.score);
                info!(
                    score = judgment.score,
                    passed = judgment.passed,
                    grade = %judgment.grade,
                    valid_votes = judgment.valid_votes(),
                    rounds = round,
                    degenerate = judgment.degenerate,
                    "Consensus reached"
                );
                return Ok(judgment);
            }

            info!(
                round,
                spread = spread.unwrap_or_default(),
                max_spread = self.settings.max_score_spread,
                "Judges disagree, running another round"
            );
        }
    }

    /// Invokes every judge once, concurrently.
    ///
    /// Exhausted rate-limit retries and cancellation abort the round; every
    /// other judge failure becomes an invalid vote.
    pub async fn run_round(
        &self,
        input: JudgeInput<'_>,
        round: u32,
        cancel: &Shutdown,
    ) -> Result<Vec<JudgeResultSummary>, ConsensusError> {
        let calls = self
            .settings
            .models
            .iter()
            .enumerate()
            .map(|(idx, model)| self.vote(input, model, round, idx, cancel));
        join_all(calls).await.into_iter().collect()
    }

    async fn vote(
        &self,
        input: JudgeInput<'_>,
        model: &str,
        round: u32,
        idx: usize,
        cancel: &Shutdown,
    ) -> Result<JudgeResultSummary, ConsensusError> {
        let invoker = &self.invoker;
        let request = input.request;
        let retried = self
            .rate_limits
            .retry_rate_limited(RateLimitSource::Judge, cancel, move || async move {
                match invoker.invoke(model, request, cancel).await {
                    Err(JudgeError::RateLimited(signal)) => Attempt::RateLimited(signal),
                    other => Attempt::Done(other),
                }
            })
            .await?;

        let vote = match retried.value {
            Ok(output) => {
                let log = input.log_dir.join(format!("judge_r{round}_{idx:02}.log"));
                if let Err(e) = tokio::fs::write(&log, &output).await {
                    warn!(path = %log.display(), error = %e, "Failed to save judge output");
                }
                parse_verdict(model, &output, &self.rubric, input.comparison)
            }
            Err(JudgeError::Cancelled) => return Err(ConsensusError::Cancelled),
            Err(e) => {
                warn!(judge = model, round, error = %e, "Judge failed, recording invalid vote");
                JudgeResultSummary::invalid(model, e.to_string())
            }
        }
        .with_rate_limit(retried.rate_limit);

        debug!(
            judge = model,
            round,
            score = vote.score,
            valid = vote.is_valid,
            "Judge voted"
        );
        self.metrics.record_judge_vote(model, vote.is_valid);
        Ok(vote)
    }

    /// Folds accumulated votes into one judgment.
    pub fn reconcile(&self, votes: &[JudgeResultSummary], rounds: u32) -> JudgmentInfo {
        let valid: Vec<&JudgeResultSummary> = votes.iter().filter(|v| v.is_valid).collect();
        if valid.is_empty() {
            return JudgmentInfo {
                score: 0.0,
                passed: false,
                grade: self.rubric.grade_scale.lowest(),
                votes: votes.to_vec(),
                rounds,
                degenerate: true,
            };
        }

        let score = valid.iter().map(|v| v.score).sum::<f64>() / valid.len() as f64;
        let passed = match self.settings.pass_rule {
            PassRule::ScoreThreshold => self.rubric.passes(score),
            PassRule::Majority => valid.iter().filter(|v| v.passed).count() * 2 > valid.len(),
        };

        JudgmentInfo {
            score,
            passed,
            grade: self.rubric.grade_for(score),
            votes: votes.to_vec(),
            rounds,
            degenerate: false,
        }
    }
}

/// Max minus min of the valid scores, or `None` with fewer than two.
fn score_spread(votes: &[JudgeResultSummary]) -> Option<f64> {
    let scores: Vec<f64> = votes.iter().filter(|v| v.is_valid).map(|v| v.score).collect();
    if scores.len() < 2 {
        return None;
    }
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    Some(max - min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSettings, ExperimentConfig};
    use crate::pipeline::{BuildPipelineResult, Stage, StageResult};
    use crate::rate_limit::{BackoffPolicy, RateLimitInfo};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Judge whose per-model outputs are scripted call by call.
    struct ScriptedJudge {
        scripts: Mutex<HashMap<String, Vec<Result<String, JudgeError>>>>,
    }

    impl ScriptedJudge {
        fn new(scripts: Vec<(&str, Vec<Result<&str, JudgeError>>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(m, outs)| {
                            let mut outs: Vec<_> = outs.into_iter().map(|o| o.map(String::from)).collect();
                            outs.reverse();
                            (m.to_string(), outs)
                        })
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl JudgeInvoker for ScriptedJudge {
        async fn invoke(&self, model: &str, _request: &JudgeRequest, _cancel: &Shutdown) -> Result<String, JudgeError> {
            let mut scripts = self.scripts.lock().unwrap();
            let outs = scripts.get_mut(model).unwrap();
            if outs.len() > 1 {
                outs.pop().unwrap()
            } else {
                outs.last().cloned().unwrap()
            }
        }
    }

    const RUBRIC: &str = r#"
pass_threshold: 0.6
categories:
  - name: functional
    scoring_type: checklist
    items:
      - id: works
        description: It works
"#;

    struct Fixture {
        dir: TempDir,
        request: JudgeRequest,
        comparison: PipelineComparison,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let snapshot = BuildPipelineResult::new(vec![StageResult::skipped(Stage::Build)]);
            Self {
                request: JudgeRequest {
                    prompt: "grade".to_string(),
                    prompt_file: dir.path().join("judge_prompt.md"),
                    workspace: dir.path().to_path_buf(),
                },
                comparison: PipelineComparison::between(&snapshot, &snapshot),
                dir,
            }
        }

        fn input(&self) -> JudgeInput<'_> {
            JudgeInput {
                request: &self.request,
                comparison: &self.comparison,
                log_dir: self.dir.path(),
            }
        }
    }

    fn engine(judge: ScriptedJudge, settings: JudgeSettings, max_retries: u32) -> JudgeConsensusEngine {
        let policy = BackoffPolicy {
            initial_secs: 0.01,
            multiplier: 2.0,
            max_secs: 0.02,
            max_retries,
        };
        JudgeConsensusEngine::new(
            Arc::new(judge),
            settings,
            Arc::new(Rubric::from_yaml_str(RUBRIC).unwrap()),
            Arc::new(RateLimitTracker::new(policy)),
        )
    }

    fn failed() -> JudgeError {
        JudgeError::ProcessFailed {
            exit_code: 1,
            stderr: "crash".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mean_of_valid_votes() {
        let fx = Fixture::new();
        let judge = ScriptedJudge::new(vec![
            ("a", vec![Ok(r#"{"score": 0.8}"#)]),
            ("b", vec![Ok(r#"{"score": 0.6}"#)]),
            ("c", vec![Err(failed())]),
        ]);
        let engine = engine(judge, JudgeSettings::new("judge", ["a", "b", "c"]), 1);

        let judgment = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap();

        assert!((judgment.score - 0.7).abs() < 1e-9);
        assert!(judgment.passed);
        assert_eq!(judgment.grade, "B");
        assert_eq!(judgment.votes.len(), 3);
        assert_eq!(judgment.valid_votes(), 2);
        assert_eq!(judgment.rounds, 1);
        assert!(!judgment.degenerate);
        assert!(fx.dir.path().join("judge_r1_00.log").exists());
    }

    #[tokio::test]
    async fn test_all_invalid_returns_zero_sentinel() {
        let fx = Fixture::new();
        let judge = ScriptedJudge::new(vec![
            ("a", vec![Ok("no verdict here")]),
            ("b", vec![Err(JudgeError::Timeout { seconds: 600 })]),
            ("c", vec![Err(failed())]),
        ]);
        let engine = engine(judge, JudgeSettings::new("judge", ["a", "b", "c"]), 1);

        let judgment = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap();

        assert_eq!(judgment.score, 0.0);
        assert!(!judgment.passed);
        assert_eq!(judgment.grade, "F");
        assert!(judgment.degenerate);
        assert_eq!(judgment.valid_votes(), 0);
    }

    #[tokio::test]
    async fn test_disagreement_triggers_bounded_rounds() {
        let fx = Fixture::new();
        let judge = ScriptedJudge::new(vec![
            ("a", vec![Ok(r#"{"score": 1.0}"#)]),
            ("b", vec![Ok(r#"{"score": 0.0}"#)]),
        ]);
        let settings = JudgeSettings::new("judge", ["a", "b"]).with_max_rounds(3);
        let engine = engine(judge, settings, 1);

        let judgment = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap();

        assert_eq!(judgment.rounds, 3);
        assert_eq!(judgment.votes.len(), 6);
        assert!((judgment.score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_second_round_stops_on_agreement() {
        let fx = Fixture::new();
        let judge = ScriptedJudge::new(vec![
            ("a", vec![Ok(r#"{"score": 1.0}"#), Ok(r#"{"score": 0.8}"#)]),
            ("b", vec![Ok(r#"{"score": 0.2}"#), Ok(r#"{"score": 0.7}"#)]),
        ]);
        let engine = engine(judge, JudgeSettings::new("judge", ["a", "b"]), 1);

        let judgment = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap();

        assert_eq!(judgment.rounds, 2);
        assert!((judgment.score - 0.675).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_majority_rule() {
        let fx = Fixture::new();
        let judge = ScriptedJudge::new(vec![
            ("a", vec![Ok(r#"{"score": 0.65, "passed": false}"#)]),
            ("b", vec![Ok(r#"{"score": 0.65, "passed": false}"#)]),
            ("c", vec![Ok(r#"{"score": 0.65, "passed": true}"#)]),
        ]);
        let settings = JudgeSettings::new("judge", ["a", "b", "c"]).with_pass_rule(PassRule::Majority);
        let engine = engine(judge, settings, 1);

        let judgment = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap();
        assert!(!judgment.passed);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_succeeds() {
        let fx = Fixture::new();
        let judge = ScriptedJudge::new(vec![(
            "a",
            vec![
                Err(JudgeError::RateLimited("429".to_string())),
                Ok(r#"{"score": 0.9}"#),
            ],
        )]);
        let engine = engine(judge, JudgeSettings::new("judge", ["a"]), 3);

        let judgment = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap();
        assert!(judgment.valid_votes() == 1);
        assert_eq!(judgment.score, 0.9);

        let episodes: Vec<&RateLimitInfo> = judgment.rate_limits().collect();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].source, RateLimitSource::Judge);
        assert_eq!(episodes[0].retry_count, 1);
        assert_eq!(episodes[0].last_signal, "429");

        let run = RunResult::new("T0", "00", 1, "ws").with_judgment(judgment);
        assert!(run.rate_limit.is_none());
        assert_eq!(run.rate_limit_episodes().count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_is_an_error() {
        let fx = Fixture::new();
        let judge = ScriptedJudge::new(vec![("a", vec![Err(JudgeError::RateLimited("429".to_string()))])]);
        let engine = engine(judge, JudgeSettings::new("judge", ["a"]), 2);

        let err = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap_err();
        match err {
            ConsensusError::RateLimited(info) => {
                assert_eq!(info.source, RateLimitSource::Judge);
                assert_eq!(info.retry_count, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_judges() {
        let fx = Fixture::new();
        let engine = engine(ScriptedJudge::new(vec![]), JudgeSettings::new("judge", Vec::<String>::new()), 1);
        let err = engine.judge(fx.input(), None, &Shutdown::new()).await.unwrap_err();
        assert!(matches!(err, ConsensusError::NoJudges));
    }

    #[tokio::test]
    async fn test_rounds_checkpointed_as_judging() {
        let fx = Fixture::new();
        let results = TempDir::new().unwrap();
        let config = ExperimentConfig::new(
            "exp",
            "/repo",
            "task",
            AgentSettings::new("agent"),
            JudgeSettings::new("judge", ["a"]),
        )
        .with_results_dir(results.path());
        let checkpoints = CheckpointManager::open(&config, false).await.unwrap();
        let run = RunResult::new("T0", "00", 1, "ws");

        let judge = ScriptedJudge::new(vec![("a", vec![Ok(r#"{"score": 0.9}"#)])]);
        let engine = engine(judge, JudgeSettings::new("judge", ["a"]), 1);
        engine
            .judge(
                fx.input(),
                Some(RoundCheckpoint {
                    checkpoints: &checkpoints,
                    run: &run,
                }),
                &Shutdown::new(),
            )
            .await
            .unwrap();

        let cp = checkpoints.load_run("T0", "00", 1).await.unwrap().unwrap();
        assert_eq!(cp.state, RunState::Judging);
        assert!(!cp.is_complete());
        assert_eq!(cp.result.judgment.unwrap().score, 0.9);
    }
}
