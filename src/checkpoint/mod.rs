//! Durable checkpoints for resumable experiments.
//!
//! # Layout
//!
//! ```text
//! <checkpoint_dir>/
//!   experiment.json              manifest: id, config digest, start time
//!   results.json                 ExperimentResult, once the run finishes
//!   <tier>/
//!     tier_result.json           finalized TierResult
//!     <subtest>/
//!       baseline.json            BuildPipelineResult captured before any run
//!       run_01.json              RunCheckpoint (state + RunResult)
//!       run_01/                  prompt, capabilities and agent transcript
//! ```
//!
//! Every document is written to a temporary file in the destination
//! directory and renamed into place, so a reader sees either the previous
//! version or the complete new one. A run only counts as complete once its
//! checkpoint reaches [`RunState::Judged`].

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::ExperimentConfig;
use crate::error::CheckpointError;
use crate::metrics::{ExperimentResult, TierResult};
use crate::pipeline::BuildPipelineResult;
use crate::runner::RunResult;

const MANIFEST_FILE: &str = "experiment.json";
const BASELINE_FILE: &str = "baseline.json";
const TIER_RESULT_FILE: &str = "tier_result.json";
const RESULTS_FILE: &str = "results.json";

/// Identity of the experiment a checkpoint tree belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentManifest {
    pub experiment_id: String,
    pub config_digest: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub resumed_at: Vec<DateTime<Utc>>,
}

/// Progress of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Agent finished; nothing judged yet.
    Executed,
    /// At least one judge round recorded.
    Judging,
    /// Consensus reached. The only complete state.
    Judged,
}

/// Checkpoint record for one (tier, subtest, run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub state: RunState,
    pub result: RunResult,
    pub updated_at: DateTime<Utc>,
}

impl RunCheckpoint {
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Judged && self.result.is_complete()
    }
}

/// Persisted baseline with a digest of its serialized pipeline result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub tier_id: String,
    pub subtest_id: String,
    pub digest: String,
    pub captured_at: DateTime<Utc>,
    pub pipeline: BuildPipelineResult,
}

/// Completed/total counts for one tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub baselines: usize,
    pub completed_runs: usize,
    pub incomplete_runs: usize,
    pub finalized: bool,
}

/// Snapshot of a checkpoint tree, for `tierbench status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub manifest: ExperimentManifest,
    pub tiers: BTreeMap<String, TierStatus>,
}

impl StatusReport {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Experiment {} (digest {}, started {})\n",
            self.manifest.experiment_id,
            &self.manifest.config_digest[..self.manifest.config_digest.len().min(12)],
            self.manifest.started_at.to_rfc3339()
        );
        for (tier, status) in &self.tiers {
            out.push_str(&format!(
                "  {}: {} baselines, {} runs complete, {} incomplete{}\n",
                tier,
                status.baselines,
                status.completed_runs,
                status.incomplete_runs,
                if status.finalized { ", finalized" } else { "" }
            ));
        }
        out
    }
}

/// Reads and writes the checkpoint tree of one experiment.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    /// Opens the checkpoint tree for `config`, creating or verifying its
    /// manifest.
    ///
    /// With `fresh`, any existing tree is discarded first. Otherwise an
    /// existing manifest must match the experiment id and config digest.
    pub async fn open(config: &ExperimentConfig, fresh: bool) -> Result<Self, CheckpointError> {
        let root = config.checkpoint_dir();
        let digest = config.digest();

        if fresh && tokio::fs::try_exists(&root).await? {
            warn!(path = %root.display(), "Discarding existing checkpoints");
            tokio::fs::remove_dir_all(&root).await?;
        }
        tokio::fs::create_dir_all(&root).await?;

        let manager = Self { root };
        let manifest = match manager.manifest().await? {
            Some(mut existing) => {
                if existing.experiment_id != config.experiment_id {
                    return Err(CheckpointError::ExperimentMismatch {
                        expected: config.experiment_id.clone(),
                        found: existing.experiment_id,
                    });
                }
                if existing.config_digest != digest {
                    return Err(CheckpointError::ConfigMismatch {
                        expected: digest,
                        found: existing.config_digest,
                    });
                }
                info!(
                    experiment = %existing.experiment_id,
                    started_at = %existing.started_at,
                    "Resuming from checkpoint"
                );
                existing.resumed_at.push(Utc::now());
                existing
            }
            None => ExperimentManifest {
                experiment_id: config.experiment_id.clone(),
                config_digest: digest,
                started_at: Utc::now(),
                resumed_at: Vec::new(),
            },
        };
        manager.publish(&manager.root.join(MANIFEST_FILE), &manifest).await?;

        Ok(manager)
    }

    /// Read-only access to an existing tree.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subtest_dir(&self, tier: &str, subtest: &str) -> PathBuf {
        self.root.join(tier).join(subtest)
    }

    /// Directory for a run's prompt and transcript files.
    pub fn run_dir(&self, tier: &str, subtest: &str, run: u32) -> PathBuf {
        self.subtest_dir(tier, subtest).join(format!("run_{run:02}"))
    }

    fn run_file(&self, tier: &str, subtest: &str, run: u32) -> PathBuf {
        self.subtest_dir(tier, subtest).join(format!("run_{run:02}.json"))
    }

    pub async fn manifest(&self) -> Result<Option<ExperimentManifest>, CheckpointError> {
        self.read(&self.root.join(MANIFEST_FILE)).await
    }

    pub async fn save_baseline(
        &self,
        tier: &str,
        subtest: &str,
        pipeline: &BuildPipelineResult,
    ) -> Result<BaselineRecord, CheckpointError> {
        let record = BaselineRecord {
            tier_id: tier.to_string(),
            subtest_id: subtest.to_string(),
            digest: pipeline.digest(),
            captured_at: Utc::now(),
            pipeline: pipeline.clone(),
        };
        self.publish(&self.subtest_dir(tier, subtest).join(BASELINE_FILE), &record)
            .await?;
        debug!(tier, subtest, digest = %record.digest, "Baseline checkpointed");
        Ok(record)
    }

    /// Loads a baseline, rejecting one whose content no longer matches its
    /// digest.
    pub async fn load_baseline(&self, tier: &str, subtest: &str) -> Result<Option<BaselineRecord>, CheckpointError> {
        let path = self.subtest_dir(tier, subtest).join(BASELINE_FILE);
        let Some(record) = self.read::<BaselineRecord>(&path).await? else {
            return Ok(None);
        };
        if record.pipeline.digest() != record.digest {
            return Err(CheckpointError::Corrupt {
                path,
                reason: "baseline digest mismatch".to_string(),
            });
        }
        Ok(Some(record))
    }

    pub async fn save_run(&self, state: RunState, result: &RunResult) -> Result<(), CheckpointError> {
        let record = RunCheckpoint {
            state,
            result: result.clone(),
            updated_at: Utc::now(),
        };
        let path = self.run_file(&result.tier_id, &result.subtest_id, result.run_number);
        self.publish(&path, &record).await?;
        debug!(
            tier = %result.tier_id,
            subtest = %result.subtest_id,
            run = result.run_number,
            state = ?state,
            "Run checkpointed"
        );
        Ok(())
    }

    pub async fn load_run(&self, tier: &str, subtest: &str, run: u32) -> Result<Option<RunCheckpoint>, CheckpointError> {
        self.read(&self.run_file(tier, subtest, run)).await
    }

    /// Runs of a subtest whose checkpoint is complete, by run number.
    pub async fn completed_runs(&self, tier: &str, subtest: &str) -> Result<BTreeMap<u32, RunResult>, CheckpointError> {
        let dir = self.subtest_dir(tier, subtest);
        let mut completed = BTreeMap::new();
        for run in run_numbers_in(&dir).await? {
            if let Some(cp) = self.load_run(tier, subtest, run).await? {
                if cp.is_complete() {
                    completed.insert(run, cp.result);
                }
            }
        }
        Ok(completed)
    }

    pub async fn save_tier_result(&self, result: &TierResult) -> Result<(), CheckpointError> {
        self.publish(&self.root.join(&result.tier_id).join(TIER_RESULT_FILE), result)
            .await
    }

    pub async fn load_tier_result(&self, tier: &str) -> Result<Option<TierResult>, CheckpointError> {
        self.read(&self.root.join(tier).join(TIER_RESULT_FILE)).await
    }

    /// Publishes the final experiment result next to the manifest.
    pub async fn save_experiment_result(&self, result: &ExperimentResult) -> Result<PathBuf, CheckpointError> {
        let path = self.root.join(RESULTS_FILE);
        self.publish(&path, result).await?;
        Ok(path)
    }

    /// Summarizes the tree. Fails if there is no manifest.
    pub async fn status(&self) -> Result<StatusReport, CheckpointError> {
        let manifest_path = self.root.join(MANIFEST_FILE);
        let manifest = self
            .manifest()
            .await?
            .ok_or_else(|| CheckpointError::Corrupt {
                path: manifest_path,
                reason: "no experiment manifest".to_string(),
            })?;

        let mut tiers = BTreeMap::new();
        for tier in subdirectories(&self.root).await? {
            let mut status = TierStatus {
                finalized: tokio::fs::try_exists(self.root.join(&tier).join(TIER_RESULT_FILE)).await?,
                ..Default::default()
            };
            for subtest in subdirectories(&self.root.join(&tier)).await? {
                let dir = self.subtest_dir(&tier, &subtest);
                if tokio::fs::try_exists(dir.join(BASELINE_FILE)).await? {
                    status.baselines += 1;
                }
                for run in run_numbers_in(&dir).await? {
                    match self.load_run(&tier, &subtest, run).await {
                        Ok(Some(cp)) if cp.is_complete() => status.completed_runs += 1,
                        _ => status.incomplete_runs += 1,
                    }
                }
            }
            tiers.insert(tier, status);
        }

        Ok(StatusReport { manifest, tiers })
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, CheckpointError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Serializes `value` and atomically replaces `path` with it.
    async fn publish<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| CheckpointError::Io(std::io::Error::other(e)))?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CheckpointError::Publish {
        path: path.to_path_buf(),
        reason: e.error.to_string(),
    })?;
    Ok(())
}

async fn subdirectories(dir: &Path) -> Result<Vec<String>, CheckpointError> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

async fn run_numbers_in(dir: &Path) -> Result<Vec<u32>, CheckpointError> {
    let mut runs = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(n) = name
            .strip_prefix("run_")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|n| n.parse().ok())
        {
            runs.push(n);
        }
    }
    runs.sort_unstable();
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSettings, JudgeSettings};
    use crate::pipeline::{Stage, StageResult};
    use crate::runner::JudgmentInfo;
    use tempfile::TempDir;

    fn config(results: &Path) -> ExperimentConfig {
        ExperimentConfig::new(
            "exp",
            "/repo",
            "fix the bug",
            AgentSettings::new("agent"),
            JudgeSettings::new("judge", ["m1"]),
        )
        .with_results_dir(results)
    }

    fn pipeline() -> BuildPipelineResult {
        BuildPipelineResult::new(vec![
            StageResult::skipped(Stage::Build),
            StageResult::skipped(Stage::Lint),
            StageResult::skipped(Stage::Test),
        ])
    }

    fn judged(run: u32) -> RunResult {
        RunResult::new("T0", "00", run, "ws")
            .with_judgment(JudgmentInfo {
                score: 0.8,
                passed: true,
                grade: "A".to_string(),
                votes: Vec::new(),
                rounds: 1,
                degenerate: false,
            })
            .completed()
    }

    #[tokio::test]
    async fn test_manifest_created_and_resumed() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());

        let first = CheckpointManager::open(&cfg, false).await.unwrap();
        let manifest = first.manifest().await.unwrap().unwrap();
        assert_eq!(manifest.experiment_id, "exp");
        assert_eq!(manifest.config_digest, cfg.digest());

        let second = CheckpointManager::open(&cfg, false).await.unwrap();
        let resumed = second.manifest().await.unwrap().unwrap();
        assert_eq!(resumed.started_at, manifest.started_at);
        assert_eq!(resumed.resumed_at.len(), 1);
    }

    #[tokio::test]
    async fn test_config_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        CheckpointManager::open(&config(dir.path()), false).await.unwrap();

        let changed = config(dir.path()).with_runs_per_subtest(3);
        let err = CheckpointManager::open(&changed, false).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ConfigMismatch { .. }));

        // Operational knobs may change.
        let more_workers = config(dir.path()).with_max_workers(16);
        CheckpointManager::open(&more_workers, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_discards_tree() {
        let dir = TempDir::new().unwrap();
        let cp = CheckpointManager::open(&config(dir.path()), false).await.unwrap();
        cp.save_run(RunState::Judged, &judged(1)).await.unwrap();

        let changed = config(dir.path()).with_runs_per_subtest(3);
        let cp = CheckpointManager::open(&changed, true).await.unwrap();
        assert!(cp.completed_runs("T0", "00").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_judged_runs_complete() {
        let dir = TempDir::new().unwrap();
        let cp = CheckpointManager::open(&config(dir.path()), false).await.unwrap();

        cp.save_run(RunState::Judged, &judged(1)).await.unwrap();
        cp.save_run(RunState::Executed, &RunResult::new("T0", "00", 2, "ws"))
            .await
            .unwrap();
        cp.save_run(RunState::Judged, &judged(3).with_framework_error("judge rate limited"))
            .await
            .unwrap();

        let completed = cp.completed_runs("T0", "00").await.unwrap();
        assert_eq!(completed.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_baseline_roundtrip_and_corruption() {
        let dir = TempDir::new().unwrap();
        let cp = CheckpointManager::open(&config(dir.path()), false).await.unwrap();
        assert!(cp.load_baseline("T0", "00").await.unwrap().is_none());

        let saved = cp.save_baseline("T0", "00", &pipeline()).await.unwrap();
        let loaded = cp.load_baseline("T0", "00").await.unwrap().unwrap();
        assert_eq!(loaded.pipeline, saved.pipeline);

        std::fs::write(cp.subtest_dir("T0", "00").join(BASELINE_FILE), "{ not json").unwrap();
        let err = cp.load_baseline("T0", "00").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let cp = CheckpointManager::open(&config(dir.path()), false).await.unwrap();
        cp.save_run(RunState::Judged, &judged(1)).await.unwrap();
        cp.save_run(RunState::Judged, &judged(1)).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(cp.subtest_dir("T0", "00"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["run_01.json"]);
    }

    #[tokio::test]
    async fn test_status_report() {
        let dir = TempDir::new().unwrap();
        let cp = CheckpointManager::open(&config(dir.path()), false).await.unwrap();
        cp.save_baseline("T0", "00", &pipeline()).await.unwrap();
        cp.save_run(RunState::Judged, &judged(1)).await.unwrap();
        cp.save_run(RunState::Judging, &RunResult::new("T0", "00", 2, "ws"))
            .await
            .unwrap();
        std::fs::create_dir_all(cp.run_dir("T0", "00", 1)).unwrap();

        let report = CheckpointManager::at(cp.root()).status().await.unwrap();
        let t0 = &report.tiers["T0"];
        assert_eq!(t0.baselines, 1);
        assert_eq!(t0.completed_runs, 1);
        assert_eq!(t0.incomplete_runs, 1);
        assert!(!t0.finalized);
        assert!(report.render().contains("T0: 1 baselines, 1 runs complete, 1 incomplete"));
    }

    #[tokio::test]
    async fn test_status_lists_ids_that_look_like_run_dirs() {
        let dir = TempDir::new().unwrap();
        let cp = CheckpointManager::open(&config(dir.path()), false).await.unwrap();
        cp.save_baseline("run_t", "run_a", &pipeline()).await.unwrap();
        cp.save_run(RunState::Judged, &RunResult::new("run_t", "run_a", 1, "ws").with_judgment(JudgmentInfo {
            score: 0.9,
            passed: true,
            grade: "A".to_string(),
            votes: Vec::new(),
            rounds: 1,
            degenerate: false,
        }))
        .await
        .unwrap();

        let report = CheckpointManager::at(cp.root()).status().await.unwrap();
        let tier = &report.tiers["run_t"];
        assert_eq!(tier.baselines, 1);
        assert_eq!(tier.completed_runs, 1);
    }

    #[tokio::test]
    async fn test_status_without_manifest() {
        let dir = TempDir::new().unwrap();
        let err = CheckpointManager::at(dir.path()).status().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }
}
