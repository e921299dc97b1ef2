//! At-most-once baseline capture per subtest.
//!
//! The first caller for a subtest either loads the checkpointed baseline or
//! captures it in a dedicated `baseline` worktree and publishes it; later
//! callers wait on the same cell and share the result. A failed or cancelled
//! capture leaves the cell empty so a later call can try again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use super::result::BuildPipelineResult;
use super::runner::PipelineRunner;
use crate::checkpoint::CheckpointManager;
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;
use crate::workspace::{WorkspaceIsolationProvider, WorkspaceSlot};

type Cell = Arc<OnceCell<Arc<BuildPipelineResult>>>;

pub struct BaselineStore {
    workspaces: Arc<WorkspaceIsolationProvider>,
    runner: PipelineRunner,
    checkpoints: CheckpointManager,
    metrics: MetricsCollector,
    cells: Mutex<HashMap<(String, String), Cell>>,
}

impl BaselineStore {
    pub fn new(workspaces: Arc<WorkspaceIsolationProvider>, runner: PipelineRunner, checkpoints: CheckpointManager) -> Self {
        Self {
            workspaces,
            runner,
            checkpoints,
            metrics: MetricsCollector::new(),
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the baseline for a subtest, capturing it only if no
    /// checkpointed copy exists.
    pub async fn get_or_capture(
        &self,
        tier: &str,
        subtest: &str,
        cancel: &Shutdown,
    ) -> Result<Arc<BuildPipelineResult>, PipelineError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry((tier.to_string(), subtest.to_string()))
                .or_default()
                .clone()
        };

        cell.get_or_try_init(|| self.load_or_capture(tier, subtest, cancel))
            .await
            .cloned()
    }

    async fn load_or_capture(
        &self,
        tier: &str,
        subtest: &str,
        cancel: &Shutdown,
    ) -> Result<Arc<BuildPipelineResult>, PipelineError> {
        if let Some(record) = self.checkpoints.load_baseline(tier, subtest).await? {
            info!(tier, subtest, digest = %record.digest, "Reusing checkpointed baseline");
            self.metrics.record_baseline(true);
            return Ok(Arc::new(record.pipeline));
        }

        let pipeline = self.capture(tier, subtest, cancel).await?;
        self.checkpoints.save_baseline(tier, subtest, &pipeline).await?;
        self.metrics.record_baseline(false);
        Ok(Arc::new(pipeline))
    }

    /// Captures the baseline in a fresh worktree, ignoring any checkpoint.
    pub async fn capture(&self, tier: &str, subtest: &str, cancel: &Shutdown) -> Result<BuildPipelineResult, PipelineError> {
        info!(tier, subtest, "Capturing baseline pipeline");
        let runner = &self.runner;
        self.workspaces
            .with_workspace(tier, subtest, WorkspaceSlot::Baseline, |ws| async move {
                runner.run(&ws.path, cancel).await
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSettings, ExperimentConfig, JudgeSettings, PipelineCommands};
    use crate::pipeline::Stage;
    use crate::workspace::init_repo;
    use tempfile::TempDir;

    struct Fixture {
        _repo: TempDir,
        _root: TempDir,
        _results: TempDir,
        store: Arc<BaselineStore>,
        checkpoints: CheckpointManager,
        marker: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let root = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let marker = results.path().join("captures.log");

        let config = ExperimentConfig::new(
            "exp",
            repo.path(),
            "task",
            AgentSettings::new("agent"),
            JudgeSettings::new("judge", ["m"]),
        )
        .with_results_dir(results.path());
        let checkpoints = CheckpointManager::open(&config, false).await.unwrap();

        let provider = WorkspaceIsolationProvider::new("exp", repo.path(), "HEAD", root.path())
            .await
            .unwrap();
        let runner = PipelineRunner::new(PipelineCommands {
            build: Some(format!("echo captured >> {}; cat README.md", marker.display())),
            lint: None,
            test: Some("test -f README.md".to_string()),
            timeout_secs: 10,
        });

        Fixture {
            store: Arc::new(BaselineStore::new(Arc::new(provider), runner, checkpoints.clone())),
            checkpoints,
            marker,
            _repo: repo,
            _root: root,
            _results: results,
        }
    }

    fn capture_count(marker: &std::path::Path) -> usize {
        std::fs::read_to_string(marker).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_concurrent_callers_capture_once() {
        let fx = fixture().await;
        let cancel = Shutdown::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = fx.store.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                store.get_or_capture("T0", "00", &cancel).await.unwrap()
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(capture_count(&fx.marker), 1);
        assert!(results.iter().all(|r| r == &results[0]));
        assert_eq!(results[0].stage(Stage::Build).unwrap().output, "hello");
        assert!(results[0].all_passed);
    }

    #[tokio::test]
    async fn test_checkpointed_baseline_skips_capture() {
        let fx = fixture().await;
        let cancel = Shutdown::new();
        let first = fx.store.capture("T0", "00", &cancel).await.unwrap();
        fx.checkpoints.save_baseline("T0", "00", &first).await.unwrap();
        assert_eq!(capture_count(&fx.marker), 1);

        let loaded = fx.store.get_or_capture("T0", "00", &cancel).await.unwrap();
        assert_eq!(capture_count(&fx.marker), 1);
        assert_eq!(*loaded, first);
    }

    #[tokio::test]
    async fn test_forced_recapture_is_byte_identical() {
        let fx = fixture().await;
        let cancel = Shutdown::new();
        let first = fx.store.capture("T0", "00", &cancel).await.unwrap();
        let second = fx.store.capture("T0", "00", &cancel).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_cancelled_capture_can_retry() {
        let fx = fixture().await;
        let cancelled = Shutdown::new();
        cancelled.trigger();
        assert!(fx.store.get_or_capture("T0", "01", &cancelled).await.is_err());

        let ok = fx.store.get_or_capture("T0", "01", &Shutdown::new()).await;
        assert!(ok.is_ok());
    }
}
