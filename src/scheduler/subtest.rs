//! Execution of a single (tier, subtest, run) unit.
//!
//! A unit owns its worktree for its whole lifetime: agent, post pipeline,
//! judging, then release. The checkpoint is advanced after each stage and
//! only reaches `Judged` once consensus is in.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointManager, RunState};
use crate::config::{CapabilityBundle, ExperimentConfig, SubTestDefinition};
use crate::error::{AgentError, ConsensusError, PipelineError, TierError};
use crate::judge::{JudgeConsensusEngine, JudgeContext, JudgeInput, RoundCheckpoint};
use crate::metrics::MetricsCollector;
use crate::pipeline::{BuildPipelineResult, PipelineComparison, PipelineRunner};
use crate::runner::{AgentExecutor, AgentRun, RunResult};
use crate::shutdown::Shutdown;
use crate::workspace::{FileListing, WorkspaceId, WorkspaceIsolationProvider, WorkspaceSlot};

/// Files listed for the judges before the listing is cut off.
const MAX_LISTED_FILES: usize = 500;

/// Everything a worker needs to execute one run.
#[derive(Debug, Clone)]
pub struct RunUnit {
    pub tier_id: String,
    pub subtest: Arc<SubTestDefinition>,
    /// Fully merged bundle: inherited, tier and subtest layers.
    pub capabilities: Arc<CapabilityBundle>,
    pub baseline: Arc<BuildPipelineResult>,
    pub run_number: u32,
}

pub struct SubTestExecutor {
    task: String,
    workspaces: Arc<WorkspaceIsolationProvider>,
    post_pipeline: PipelineRunner,
    agent: AgentExecutor,
    judge: JudgeConsensusEngine,
    checkpoints: CheckpointManager,
    metrics: MetricsCollector,
}

impl SubTestExecutor {
    pub fn new(
        config: &ExperimentConfig,
        workspaces: Arc<WorkspaceIsolationProvider>,
        agent: AgentExecutor,
        judge: JudgeConsensusEngine,
        checkpoints: CheckpointManager,
    ) -> Self {
        Self {
            task: config.task.clone(),
            workspaces,
            post_pipeline: PipelineRunner::new(config.pipeline.clone()),
            agent,
            judge,
            checkpoints,
            metrics: MetricsCollector::new(),
        }
    }

    /// Executes one run in its own worktree.
    ///
    /// Execution and isolation faults come back as a run carrying a
    /// framework error, checkpointed as not complete. Only cancellation and
    /// checkpoint failures are errors.
    pub async fn run_one(&self, unit: RunUnit, cancel: &Shutdown) -> Result<RunResult, TierError> {
        if cancel.is_triggered() {
            return Err(TierError::Cancelled);
        }

        let slot = WorkspaceSlot::Run(unit.run_number);
        let outcome = self
            .workspaces
            .with_workspace(&unit.tier_id, &unit.subtest.id, slot, |ws| {
                self.execute_in(&unit, ws, cancel)
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(e) => {
                let run = RunResult::new(&unit.tier_id, &unit.subtest.id, unit.run_number, "");
                self.fail(run, format!("workspace isolation: {e}")).await
            }
        }
    }

    async fn execute_in(&self, unit: &RunUnit, ws: WorkspaceId, cancel: &Shutdown) -> Result<RunResult, TierError> {
        let tier = unit.tier_id.as_str();
        let subtest = unit.subtest.id.as_str();
        let run_number = unit.run_number;
        let run_dir = self.checkpoints.run_dir(tier, subtest, run_number);
        let task = unit.subtest.task.as_deref().unwrap_or(&self.task);
        let run = RunResult::new(tier, subtest, run_number, &ws.id);

        debug!(tier, subtest, run = run_number, workspace = %ws.id, "Run started");

        let agent_run = AgentRun {
            tier_id: tier,
            subtest_id: subtest,
            run_number,
            task,
            capabilities: &unit.capabilities,
            workspace: &ws.path,
            run_dir: &run_dir,
        };
        let execution = match self.agent.execute(&agent_run, cancel).await {
            Ok(execution) => execution,
            Err(AgentError::Cancelled) => return Err(TierError::Cancelled),
            Err(AgentError::RateLimited(info)) => {
                let reason = format!("agent rate limit retries exhausted after {} attempts", info.retry_count);
                return self.fail(run.with_rate_limit(info), reason).await;
            }
            Err(e) => return self.fail(run, e.to_string()).await,
        };
        let run = run.with_execution(&execution);
        if let Some(err) = &execution.spawn_error {
            return self.fail(run, format!("agent failed to start: {err}")).await;
        }
        self.checkpoints.save_run(RunState::Executed, &run).await?;

        let post = match self.post_pipeline.run(&ws.path, cancel).await {
            Ok(post) => post,
            Err(PipelineError::Cancelled) => return Err(TierError::Cancelled),
            Err(e) => return self.fail(run, format!("post pipeline: {e}")).await,
        };
        save_post_pipeline(&run_dir, &post).await;

        let comparison = PipelineComparison::between(&unit.baseline, &post);
        if comparison.has_regression() {
            info!(tier, subtest, run = run_number, "Post pipeline shows a regression");
        }

        let root = ws.path.clone();
        let listing = match tokio::task::spawn_blocking(move || FileListing::collect(&root, MAX_LISTED_FILES)).await {
            Ok(listing) => listing,
            Err(e) => return self.fail(run, format!("workspace listing: {e}")).await,
        };

        let context = JudgeContext {
            task,
            rubric: self.judge.rubric(),
            baseline: &unit.baseline,
            post: &post,
            comparison: &comparison,
            transcript: &execution.stdout,
            listing: &listing,
        };
        let request = match self.judge.prepare(&context, &ws.path, &run_dir).await {
            Ok(request) => request,
            Err(e) => return self.fail(run, format!("judge prompt: {e}")).await,
        };

        let input = JudgeInput {
            request: &request,
            comparison: &comparison,
            log_dir: &run_dir,
        };
        let progress = RoundCheckpoint {
            checkpoints: &self.checkpoints,
            run: &run,
        };
        let judgment = match self.judge.judge(input, Some(progress), cancel).await {
            Ok(judgment) => judgment,
            Err(ConsensusError::Cancelled) => return Err(TierError::Cancelled),
            Err(ConsensusError::Checkpoint(e)) => return Err(e.into()),
            Err(ConsensusError::RateLimited(info)) => {
                let reason = format!("judge rate limit retries exhausted after {} attempts", info.retry_count);
                return self.fail(run.with_rate_limit(info), reason).await;
            }
            Err(e) => return self.fail(run, e.to_string()).await,
        };

        let run = run.with_judgment(judgment).completed();
        self.checkpoints.save_run(RunState::Judged, &run).await?;
        self.metrics.record_run(&run);

        info!(
            tier,
            subtest,
            run = run_number,
            score = run.score(),
            passed = run.passed(),
            cost_usd = run.cost_usd,
            rate_limit_episodes = run.rate_limit_episodes().count(),
            "Run judged"
        );
        Ok(run)
    }

    /// Records a framework error on the run and checkpoints it as not
    /// complete, so a resume executes it again.
    async fn fail(&self, run: RunResult, reason: String) -> Result<RunResult, TierError> {
        warn!(
            tier = %run.tier_id,
            subtest = %run.subtest_id,
            run = run.run_number,
            error = %reason,
            "Run failed with framework error"
        );
        let run = run.with_framework_error(reason).completed();
        self.checkpoints.save_run(RunState::Executed, &run).await?;
        self.metrics.record_run(&run);
        Ok(run)
    }
}

async fn save_post_pipeline(run_dir: &Path, post: &BuildPipelineResult) {
    let path = run_dir.join("post_pipeline.json");
    let written = match serde_json::to_vec_pretty(post) {
        Ok(bytes) => tokio::fs::write(&path, bytes).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = written {
        warn!(path = %path.display(), error = %e, "Failed to save post pipeline");
    }
}
