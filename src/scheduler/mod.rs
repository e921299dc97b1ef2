//! Tier scheduling with a bounded worker pool.
//!
//! This module turns an experiment configuration into executed, judged and
//! aggregated runs:
//!
//! - **TierOrchestrator**: dependency waves, per-tier failure isolation,
//!   capability inheritance, final experiment result
//! - **SubTestExecutor**: one (tier, subtest, run) unit from worktree to
//!   judged checkpoint
//! - **WorkerPool**: the slot limit every unit waits on
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────┐
//!                      │ TierOrchestrator │
//!                      └────────┬─────────┘
//!                               │ wave 1, wave 2, ...
//!         ┌─────────────────────┼─────────────────────┐
//!         ▼                     ▼                     ▼
//!    ┌─────────┐           ┌─────────┐           ┌─────────┐
//!    │ Tier T0 │           │ Tier T1 │           │ Tier T2 │   JoinSet barrier
//!    └────┬────┘           └────┬────┘           └────┬────┘
//!         │ subtests            │                     │
//!         ▼                     ▼                     ▼
//!   baseline (once) ──► run 1..N, each waiting for a WorkerPool slot
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tierbench::config::ExperimentConfig;
//! use tierbench::scheduler::TierOrchestrator;
//! use tierbench::shutdown::Shutdown;
//!
//! let config = ExperimentConfig::from_yaml_file(path)?;
//! let orchestrator = TierOrchestrator::from_config(config, false, Shutdown::new()).await?;
//! let result = orchestrator.run().await?;
//! println!("{}", result.summary());
//! ```
//!
//! # Failure handling
//!
//! - **Run faults** (agent crash, judge rate limit exhaustion, worktree
//!   collision) are recorded on the run and left incomplete for resume
//! - **Tier faults** (baseline capture error, panic, every run failed) fail
//!   only that tier
//! - **Experiment failure** happens only when every selected tier failed

pub mod orchestrator;
pub mod subtest;
pub mod worker_pool;

pub use orchestrator::TierOrchestrator;
pub use subtest::{RunUnit, SubTestExecutor};
pub use worker_pool::{PoolStats, WorkerPool};
