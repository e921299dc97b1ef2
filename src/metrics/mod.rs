//! Metrics: result aggregation and Prometheus monitoring.
//!
//! [`MetricsAggregator`] folds [`crate::runner::RunResult`]s into per-subtest
//! and per-tier statistics (pass rate, mean cost, Cost-of-Pass).
//! [`MetricsCollector`] records operational counters for Prometheus.
//!
//! # Example
//!
//! ```ignore
//! use tierbench::metrics::{init_metrics, export_metrics, MetricsAggregator};
//!
//! init_metrics()?;
//!
//! let mut aggregator = MetricsAggregator::new();
//! for run in runs {
//!     aggregator.record(run);
//! }
//! let tier = aggregator.tier_result("T0");
//! println!("winner: {:?}", tier.best_subtest);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod aggregate;
pub mod collectors;
pub mod prometheus;

pub use aggregate::{ExperimentResult, MetricsAggregator, SubTestResult, TierResult, Winner};
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
