//! Git worktree isolation for agent runs.
//!
//! Every workspace is a fresh worktree on its own branch, branched from the
//! experiment's base ref. Identifiers are scoped by a per-process namespace
//! (`{experiment_id}-{nonce}`) so separate orchestrator processes sharing one
//! base clone never compute the same branch or path, even for the same
//! experiment id.
//!
//! # Naming
//!
//! - Branch: `tierbench/<namespace>/<tier>/<subtest>/<slot>`
//! - Path: `<workspace_root>/<namespace>/<tier>/<subtest>/<slot>`
//!
//! where `<slot>` is `baseline` or `run-NN`.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::validate_identifier;
use crate::error::WorkspaceError;

/// Which unit of work a workspace serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceSlot {
    Baseline,
    Run(u32),
}

impl fmt::Display for WorkspaceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceSlot::Baseline => f.write_str("baseline"),
            WorkspaceSlot::Run(n) => write!(f, "run-{n:02}"),
        }
    }
}

/// Branch and path reserved for one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceId {
    /// `<namespace>/<tier>/<subtest>/<slot>`
    pub id: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Sole owner of the workspace-identifier namespace.
#[derive(Debug, Clone)]
pub struct WorkspaceIsolationProvider {
    base_repo: PathBuf,
    base_ref: String,
    workspace_root: PathBuf,
    namespace: String,
    preserve: bool,
}

impl WorkspaceIsolationProvider {
    /// Creates a provider after checking `base_repo` is a git repository.
    pub async fn new(
        experiment_id: &str,
        base_repo: impl Into<PathBuf>,
        base_ref: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
    ) -> Result<Self, WorkspaceError> {
        validate_identifier("experiment_id", experiment_id)?;
        let base_repo = base_repo.into();

        let status = git(&base_repo)
            .args(["rev-parse", "--git-dir"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !matches!(status, Ok(s) if s.success()) {
            return Err(WorkspaceError::NotARepository(base_repo));
        }

        let namespace = Self::namespace_for(experiment_id);
        info!(namespace = %namespace, repo = %base_repo.display(), "Workspace namespace reserved");

        Ok(Self {
            base_repo,
            base_ref: base_ref.into(),
            workspace_root: workspace_root.into(),
            namespace,
            preserve: false,
        })
    }

    /// Keeps worktrees on disk after release.
    pub fn preserving(mut self, preserve: bool) -> Self {
        self.preserve = preserve;
        self
    }

    /// Experiment-unique prefix: the id plus 8 hex chars of
    /// SHA-256(id, pid, random nonce).
    pub fn namespace_for(experiment_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(experiment_id.as_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}", experiment_id, &digest[..8])
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Computes the identifier for a unit of work without touching disk.
    pub fn identifier(&self, tier: &str, subtest: &str, slot: WorkspaceSlot) -> Result<WorkspaceId, WorkspaceError> {
        validate_identifier("tier id", tier)?;
        validate_identifier("subtest id", subtest)?;

        let slot = slot.to_string();
        Ok(WorkspaceId {
            id: format!("{}/{}/{}/{}", self.namespace, tier, subtest, slot),
            branch: format!("tierbench/{}/{}/{}/{}", self.namespace, tier, subtest, slot),
            path: self
                .workspace_root
                .join(&self.namespace)
                .join(tier)
                .join(subtest)
                .join(slot),
        })
    }

    /// Creates a fresh worktree for the unit of work.
    ///
    /// Fails with [`WorkspaceError::IdentifierCollision`] if the branch or
    /// path already exists. Existing references are never removed or
    /// overwritten.
    pub async fn acquire(&self, tier: &str, subtest: &str, slot: WorkspaceSlot) -> Result<WorkspaceHandle, WorkspaceError> {
        let id = self.identifier(tier, subtest, slot)?;

        let branch_exists = git(&self.base_repo)
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{}", id.branch)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?
            .success();
        if branch_exists {
            return Err(WorkspaceError::IdentifierCollision {
                identifier: id.id,
                reason: format!("branch '{}' already exists", id.branch),
            });
        }
        if tokio::fs::try_exists(&id.path).await? {
            return Err(WorkspaceError::IdentifierCollision {
                identifier: id.id,
                reason: format!("path '{}' already exists", id.path.display()),
            });
        }

        if let Some(parent) = id.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = git(&self.base_repo)
            .arg("worktree")
            .arg("add")
            .arg("-b")
            .arg(&id.branch)
            .arg(&id.path)
            .arg(&self.base_ref)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if stderr.contains("already exists") {
                WorkspaceError::IdentifierCollision {
                    identifier: id.id,
                    reason: stderr,
                }
            } else {
                WorkspaceError::CreateFailed {
                    identifier: id.id,
                    stderr,
                }
            });
        }

        debug!(workspace = %id.id, path = %id.path.display(), "Worktree created");

        Ok(WorkspaceHandle {
            id,
            repo: self.base_repo.clone(),
            preserve: self.preserve,
            released: false,
        })
    }

    /// Runs `f` inside a freshly acquired workspace, then releases it.
    ///
    /// The workspace is cleaned up whether `f` succeeds or fails, and by
    /// [`WorkspaceHandle`]'s drop if this future is cancelled.
    pub async fn with_workspace<F, Fut, T>(
        &self,
        tier: &str,
        subtest: &str,
        slot: WorkspaceSlot,
        f: F,
    ) -> Result<T, WorkspaceError>
    where
        F: FnOnce(WorkspaceId) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(tier, subtest, slot).await?;
        let value = f(handle.id.clone()).await;
        if let Err(e) = handle.release().await {
            warn!(error = %e, "Workspace cleanup failed");
        }
        Ok(value)
    }
}

fn git(repo: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo);
    cmd
}

/// A checked-out worktree. Removed on release or drop unless preserved.
#[derive(Debug)]
pub struct WorkspaceHandle {
    id: WorkspaceId,
    repo: PathBuf,
    preserve: bool,
    released: bool,
}

impl WorkspaceHandle {
    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.id.path
    }

    /// Suppresses cleanup for debugging.
    pub fn preserve(&mut self) {
        self.preserve = true;
    }

    /// Removes the worktree and its branch.
    pub async fn release(mut self) -> Result<(), WorkspaceError> {
        self.released = true;
        if self.preserve {
            info!(workspace = %self.id.id, path = %self.id.path.display(), "Preserving workspace");
            return Ok(());
        }

        let output = git(&self.repo)
            .arg("worktree")
            .arg("remove")
            .arg("--force")
            .arg(&self.id.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(WorkspaceError::CleanupFailed {
                identifier: self.id.id.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let output = git(&self.repo)
            .args(["branch", "-D", &self.id.branch])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(WorkspaceError::CleanupFailed {
                identifier: self.id.id.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(workspace = %self.id.id, "Worktree removed");
        Ok(())
    }
}

impl Drop for WorkspaceHandle {
    fn drop(&mut self) {
        if self.released || self.preserve {
            return;
        }
        warn!(workspace = %self.id.id, "Workspace dropped without release, cleaning up");
        let removed = std::process::Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(["worktree", "remove", "--force"])
            .arg(&self.id.path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if matches!(removed, Ok(s) if s.success()) {
            let _ = std::process::Command::new("git")
                .arg("-C")
                .arg(&self.repo)
                .args(["branch", "-D", &self.id.branch])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}
