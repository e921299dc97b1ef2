//! Isolated git workspaces for benchmark runs.
//!
//! Each baseline capture and each agent run gets its own worktree, branched
//! from the experiment's base ref. [`WorkspaceIsolationProvider`] is the only
//! component that computes workspace identifiers.
//!
//! # Example
//!
//! ```ignore
//! use tierbench::workspace::{WorkspaceIsolationProvider, WorkspaceSlot};
//!
//! let provider = WorkspaceIsolationProvider::new("exp-1", "/repos/target", "HEAD", "/tmp/ws").await?;
//! let handle = provider.acquire("T0", "00", WorkspaceSlot::Run(1)).await?;
//! // ... run the agent in handle.path() ...
//! handle.release().await?;
//! ```

mod listing;
mod provider;

pub use listing::FileListing;
pub use provider::{WorkspaceHandle, WorkspaceId, WorkspaceIsolationProvider, WorkspaceSlot};

#[cfg(test)]
pub(crate) use provider::tests::init_repo;
