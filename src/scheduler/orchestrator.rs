//! Tier orchestration.
//!
//! Tiers run in dependency waves. Within a wave every tier is its own task;
//! inside a tier every subtest is its own task; every run and baseline
//! capture waits for a slot in the shared [`WorkerPool`]. Each level joins
//! its children before finishing, so a tier's result is only built once all
//! of its runs are in.
//!
//! A tier that fails (or panics) is recorded and its siblings carry on. The
//! experiment only fails when no selected tier produced a result.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::subtest::{RunUnit, SubTestExecutor};
use super::worker_pool::WorkerPool;
use crate::checkpoint::CheckpointManager;
use crate::config::{dependency_waves, CapabilityBundle, ExperimentConfig, SubTestDefinition, TierDefinition};
use crate::error::{CheckpointError, OrchestratorError, PipelineError, TierError};
use crate::judge::{JudgeConsensusEngine, JudgeInvoker, ProcessJudge};
use crate::metrics::{ExperimentResult, MetricsAggregator, TierResult};
use crate::pipeline::{BaselineStore, PipelineRunner};
use crate::rate_limit::RateLimitTracker;
use crate::runner::{AgentAdapter, AgentExecutor, GenericAdapter, RunResult};
use crate::shutdown::Shutdown;
use crate::workspace::WorkspaceIsolationProvider;

/// A tier ready to run, with its capability bundle resolved.
#[derive(Debug, Clone)]
struct TierPlan {
    tier: TierDefinition,
    capabilities: CapabilityBundle,
    inherited_from: Option<(String, String)>,
}

/// Schedules the tiers of one experiment.
#[derive(Clone)]
pub struct TierOrchestrator {
    config: Arc<ExperimentConfig>,
    executor: Arc<SubTestExecutor>,
    baselines: Arc<BaselineStore>,
    checkpoints: CheckpointManager,
    pool: WorkerPool,
    cancel: Shutdown,
}

impl TierOrchestrator {
    /// Validates the configuration, opens (or resumes) its checkpoint tree
    /// and wires up every component.
    pub async fn new(
        config: ExperimentConfig,
        agent: Arc<dyn AgentAdapter>,
        judge: Arc<dyn JudgeInvoker>,
        fresh: bool,
        cancel: Shutdown,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let rubric = Arc::new(config.rubric()?.clone());
        let checkpoints = CheckpointManager::open(&config, fresh).await?;

        let workspaces = Arc::new(
            WorkspaceIsolationProvider::new(
                &config.experiment_id,
                &config.base_repo,
                &config.base_ref,
                &config.workspace_root,
            )
            .await?
            .preserving(config.preserve_workspaces),
        );

        let rate_limits = Arc::new(RateLimitTracker::new(config.rate_limit.clone()));
        let agent = AgentExecutor::new(agent, config.agent.clone(), rate_limits.clone());
        let judge = JudgeConsensusEngine::new(judge, config.judge.clone(), rubric, rate_limits);
        let baselines = Arc::new(BaselineStore::new(
            workspaces.clone(),
            PipelineRunner::new(config.pipeline.clone()),
            checkpoints.clone(),
        ));
        let executor = Arc::new(SubTestExecutor::new(
            &config,
            workspaces,
            agent,
            judge,
            checkpoints.clone(),
        ));

        info!(
            experiment = %config.experiment_id,
            max_workers = config.max_workers,
            runs_per_subtest = config.runs_per_subtest,
            judges = config.judge.models.len(),
            "Orchestrator ready"
        );

        Ok(Self {
            pool: WorkerPool::new(config.max_workers),
            config: Arc::new(config),
            executor,
            baselines,
            checkpoints,
            cancel,
        })
    }

    /// Builds an orchestrator around the configured agent and judge commands.
    pub async fn from_config(config: ExperimentConfig, fresh: bool, cancel: Shutdown) -> Result<Self, OrchestratorError> {
        let agent = Arc::new(GenericAdapter::from_settings(&config.agent));
        let judge = Arc::new(ProcessJudge::from_settings(&config.judge));
        Self::new(config, agent, judge, fresh, cancel).await
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Runs every selected tier and publishes the experiment result.
    ///
    /// Completed runs found in the checkpoint tree are reused. Returns
    /// [`OrchestratorError::AllTiersFailed`] only when no tier succeeded;
    /// otherwise failed tiers are listed in the result.
    pub async fn run(&self) -> Result<ExperimentResult, OrchestratorError> {
        let selected: BTreeSet<&str> = self.config.selected_tiers().iter().map(|t| t.id.as_str()).collect();
        if selected.is_empty() {
            return Err(OrchestratorError::NothingToRun);
        }

        let started_at = self
            .checkpoints
            .manifest()
            .await?
            .map(|m| m.started_at)
            .unwrap_or_else(Utc::now);

        let mut finished: BTreeMap<String, TierResult> = BTreeMap::new();
        let mut failed: BTreeMap<String, String> = BTreeMap::new();

        for wave in dependency_waves(&self.config.tiers)? {
            let wave: Vec<&TierDefinition> = wave
                .iter()
                .filter(|id| selected.contains(id.as_str()))
                .filter_map(|id| self.config.tier(id))
                .collect();
            if wave.is_empty() {
                continue;
            }
            if self.cancel.is_triggered() {
                break;
            }

            let mut tasks = JoinSet::new();
            let mut spawned = Vec::with_capacity(wave.len());
            for tier in wave {
                let plan = match self.plan(tier, &finished).await {
                    Ok(plan) => plan,
                    Err(e) => {
                        error!(tier = %tier.id, error = %e, "Failed to resolve inherited capabilities");
                        failed.insert(tier.id.clone(), e.to_string());
                        continue;
                    }
                };
                spawned.push(tier.id.clone());
                let this = self.clone();
                let tier_id = tier.id.clone();
                tasks.spawn(async move {
                    let result = isolate(this.run_tier(plan)).await;
                    (tier_id, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((tier, Ok(result))) => {
                        finished.insert(tier, result);
                    }
                    Ok((tier, Err(TierError::Cancelled))) => {
                        warn!(tier = %tier, "Tier cancelled");
                        failed.insert(tier, TierError::Cancelled.to_string());
                    }
                    Ok((tier, Err(e))) => {
                        error!(tier = %tier, error = %e, "Tier failed");
                        failed.insert(tier, e.to_string());
                    }
                    Err(e) => error!(error = %e, "Tier task aborted"),
                }
            }
            for tier in spawned {
                if !finished.contains_key(&tier) && !failed.contains_key(&tier) {
                    failed.insert(tier, "tier task aborted".to_string());
                }
            }
        }

        if self.cancel.is_triggered() {
            warn!(
                finished = finished.len(),
                "Experiment cancelled; resume to complete the remaining work"
            );
            return Err(OrchestratorError::Cancelled);
        }

        if finished.is_empty() {
            return Err(OrchestratorError::AllTiersFailed(failed.into_iter().collect()));
        }
        if !failed.is_empty() {
            warn!(
                succeeded = finished.len(),
                failed = failed.len(),
                tiers = ?failed.keys().collect::<Vec<_>>(),
                "Experiment finished with partial results"
            );
        }

        let result = ExperimentResult {
            experiment_id: self.config.experiment_id.clone(),
            tiers: finished,
            failed_tiers: failed,
            started_at,
            completed_at: Utc::now(),
        };
        let path = self.checkpoints.save_experiment_result(&result).await?;

        match MetricsAggregator::select_winner(result.tiers.values()) {
            Some(winner) => info!(
                tier = %winner.tier_id,
                subtest = %winner.subtest_id,
                cost_of_pass = winner.cost_of_pass,
                results = %path.display(),
                "Experiment complete"
            ),
            None => info!(results = %path.display(), "Experiment complete; no subtest passed"),
        }

        Ok(result)
    }

    /// Resolves the tier's capability bundle, layering it over the winner
    /// of the tiers it inherits from.
    async fn plan(&self, tier: &TierDefinition, finished: &BTreeMap<String, TierResult>) -> Result<TierPlan, CheckpointError> {
        let mut plan = TierPlan {
            tier: tier.clone(),
            capabilities: tier.capabilities.clone(),
            inherited_from: None,
        };
        if tier.inherit_best_from.is_empty() {
            return Ok(plan);
        }

        let mut candidates = Vec::new();
        for dep in &tier.inherit_best_from {
            match finished.get(dep) {
                Some(result) => candidates.push(result.clone()),
                None => match self.checkpoints.load_tier_result(dep).await? {
                    Some(result) => candidates.push(result),
                    None => warn!(tier = %tier.id, dependency = %dep, "Dependency tier has no result"),
                },
            }
        }

        let Some(winner) = MetricsAggregator::select_winner(&candidates) else {
            warn!(
                tier = %tier.id,
                from = ?tier.inherit_best_from,
                "No finite Cost-of-Pass winner to inherit, using own capabilities"
            );
            return Ok(plan);
        };

        let inherited = candidates
            .iter()
            .find(|c| c.tier_id == winner.tier_id)
            .map(|winning_tier| {
                let subtest = self
                    .config
                    .tier(&winner.tier_id)
                    .and_then(|t| t.subtest(&winner.subtest_id))
                    .map(|s| s.capabilities.clone())
                    .unwrap_or_default();
                winning_tier.capabilities.merge(&subtest)
            })
            .unwrap_or_default();

        info!(
            tier = %tier.id,
            from_tier = %winner.tier_id,
            from_subtest = %winner.subtest_id,
            cost_of_pass = winner.cost_of_pass,
            "Inheriting capabilities from winner"
        );
        plan.capabilities = inherited.merge(&tier.capabilities);
        plan.inherited_from = Some((winner.tier_id, winner.subtest_id));
        Ok(plan)
    }

    async fn run_tier(&self, plan: TierPlan) -> Result<TierResult, TierError> {
        let tier_id = plan.tier.id.clone();
        info!(tier = %tier_id, subtests = plan.tier.subtests.len(), "Starting tier");

        let capabilities = Arc::new(plan.capabilities.clone());
        let mut tasks = JoinSet::new();
        for subtest in &plan.tier.subtests {
            let this = self.clone();
            let tier_id = tier_id.clone();
            let subtest = Arc::new(subtest.clone());
            let capabilities = capabilities.clone();
            tasks.spawn(async move { isolate(this.run_subtest(tier_id, subtest, capabilities)).await });
        }

        let mut aggregator = MetricsAggregator::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap_or_else(|e| Err(TierError::Panicked(e.to_string()))) {
                Ok(runs) => runs.into_iter().for_each(|run| aggregator.record(run)),
                Err(e) => keep_first(&mut failure, e),
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if self.cancel.is_triggered() {
            return Err(TierError::Cancelled);
        }

        let mut result = aggregator.tier_result(&tier_id).with_capabilities(plan.capabilities);
        if let Some((tier, subtest)) = plan.inherited_from {
            result = result.with_inherited_from(tier, subtest);
        }
        if result.all_runs_failed() {
            return Err(TierError::AllRunsFailed {
                tier: tier_id,
                failed: result.framework_error_count(),
            });
        }

        self.checkpoints.save_tier_result(&result).await?;
        info!(
            tier = %tier_id,
            runs = result.run_count(),
            framework_errors = result.framework_error_count(),
            best = ?result.best_subtest,
            cost_usd = result.total_cost(),
            "Tier finished"
        );
        Ok(result)
    }

    /// Captures the baseline, then runs every pending run of the subtest.
    async fn run_subtest(
        &self,
        tier_id: String,
        subtest: Arc<SubTestDefinition>,
        tier_capabilities: Arc<CapabilityBundle>,
    ) -> Result<Vec<RunResult>, TierError> {
        let completed = self.checkpoints.completed_runs(&tier_id, &subtest.id).await?;
        let target = self.config.runs_per_subtest;
        let pending: Vec<u32> = (1..=target).filter(|n| !completed.contains_key(n)).collect();
        let mut runs: Vec<RunResult> = completed.into_values().filter(|r| r.run_number <= target).collect();

        if pending.is_empty() {
            debug!(tier = %tier_id, subtest = %subtest.id, "All runs already complete");
            return Ok(runs);
        }
        if !runs.is_empty() {
            info!(
                tier = %tier_id,
                subtest = %subtest.id,
                skipped = runs.len(),
                pending = pending.len(),
                "Resuming subtest"
            );
        }

        let baseline = self
            .pool
            .run(self.baselines.get_or_capture(&tier_id, &subtest.id, &self.cancel))
            .await
            .map_err(|e| match e {
                PipelineError::Cancelled => TierError::Cancelled,
                source => TierError::Baseline {
                    subtest: subtest.id.clone(),
                    source,
                },
            })?;

        let capabilities = Arc::new(tier_capabilities.merge(&subtest.capabilities));
        let mut tasks = JoinSet::new();
        for run_number in pending {
            let unit = RunUnit {
                tier_id: tier_id.clone(),
                subtest: subtest.clone(),
                capabilities: capabilities.clone(),
                baseline: baseline.clone(),
                run_number,
            };
            let executor = self.executor.clone();
            let pool = self.pool.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move { isolate(pool.run(executor.run_one(unit, &cancel))).await });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap_or_else(|e| Err(TierError::Panicked(e.to_string()))) {
                Ok(run) => runs.push(run),
                Err(e) => keep_first(&mut failure, e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(runs),
        }
    }
}

/// Keeps the first error, except that cancellation takes precedence.
fn keep_first(slot: &mut Option<TierError>, error: TierError) {
    match slot {
        None => *slot = Some(error),
        Some(TierError::Cancelled) => {}
        Some(_) if matches!(error, TierError::Cancelled) => *slot = Some(error),
        Some(_) => debug!(error = %error, "Additional failure in tier"),
    }
}

/// Turns a panic inside `fut` into [`TierError::Panicked`].
async fn isolate<T, F>(fut: F) -> Result<T, TierError>
where
    F: Future<Output = Result<T, TierError>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(TierError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_isolate_captures_panic() {
        let result: Result<(), TierError> = isolate(async { panic!("boom in tier") }).await;
        match result {
            Err(TierError::Panicked(msg)) => assert_eq!(msg, "boom in tier"),
            other => panic!("unexpected: {other:?}"),
        }

        let ok: Result<u32, TierError> = isolate(async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);
    }

    #[test]
    fn test_panic_message_formats() {
        let owned: Box<dyn Any + Send> = Box::new(format!("run {} failed", 3));
        assert_eq!(panic_message(owned.as_ref()), "run 3 failed");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_cancellation_wins_over_other_failures() {
        let mut slot = None;
        keep_first(&mut slot, TierError::Panicked("a".to_string()));
        keep_first(&mut slot, TierError::Cancelled);
        keep_first(&mut slot, TierError::Panicked("b".to_string()));
        assert!(matches!(slot, Some(TierError::Cancelled)));

        let mut slot = None;
        keep_first(&mut slot, TierError::Panicked("a".to_string()));
        keep_first(&mut slot, TierError::Panicked("b".to_string()));
        assert!(matches!(slot, Some(TierError::Panicked(ref m)) if m == "a"));
    }
}
