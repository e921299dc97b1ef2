//! Build/lint/test pipeline snapshots.
//!
//! The pipeline runs once per subtest before any agent touches the code (the
//! baseline) and once after every agent run (the post snapshot). Comparing the
//! two separates regressions the agent caused from failures that were already
//! there.
//!
//! # Components
//!
//! - **Runner** (`runner`): runs the configured stage commands in a workspace
//! - **Baseline** (`baseline`): at-most-once, checkpointed baseline capture
//! - **Result** (`result`): snapshots and stage-by-stage comparison
//!
//! # Example
//!
//! ```rust,ignore
//! use tierbench::pipeline::{PipelineComparison, PipelineRunner};
//!
//! let runner = PipelineRunner::new(config.pipeline.clone());
//! let baseline = baselines.get_or_capture("T0", "00", &cancel).await?;
//! let post = runner.run(workspace.path(), &cancel).await?;
//! let comparison = PipelineComparison::between(&baseline, &post);
//! if comparison.has_regression() {
//!     println!("{}", comparison.to_judge_text());
//! }
//! ```

pub mod baseline;
pub mod result;
pub mod runner;

pub use baseline::BaselineStore;
pub use result::{BuildPipelineResult, PipelineComparison, Stage, StageDelta, StageResult};
pub use runner::PipelineRunner;
