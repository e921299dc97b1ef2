//! Metric recording for tierbench operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with methods for the
//! events the harness produces. Recording is a no-op until
//! [`super::init_metrics`] has been called.

use super::prometheus::{
    ACTIVE_WORKERS, AGENT_COST_CENTS, AGENT_TOKENS_TOTAL, BASELINE_CAPTURES_TOTAL, CONSENSUS_SCORE,
    JUDGE_VOTES_TOTAL, RATE_LIMIT_RETRIES_TOTAL, RUNS_TOTAL, RUN_DURATION,
};
use crate::runner::RunResult;

/// Metrics collector for recording harness metrics.
///
/// # Example
///
/// ```ignore
/// use tierbench::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_run(&run_result);
/// collector.record_rate_limit_retry("judge");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a finished run: outcome, duration, tokens and cost.
    pub fn record_run(&self, run: &RunResult) {
        let outcome = run_outcome(run);
        let tier = run.tier_id.as_str();

        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&[tier, outcome]).inc();
        }
        if let Some(duration) = RUN_DURATION.get() {
            duration
                .with_label_values(&[tier])
                .observe(run.execution.duration_seconds);
        }
        if let Some(tokens) = AGENT_TOKENS_TOTAL.get() {
            tokens
                .with_label_values(&[tier, "input"])
                .inc_by(run.tokens.input_tokens as f64);
            tokens
                .with_label_values(&[tier, "output"])
                .inc_by(run.tokens.output_tokens as f64);
        }
        if let Some(cost) = AGENT_COST_CENTS.get() {
            if run.cost_usd > 0.0 {
                cost.with_label_values(&[tier]).inc_by(run.cost_usd * 100.0);
            }
        }

        tracing::trace!(
            tier = tier,
            subtest = %run.subtest_id,
            run = run.run_number,
            outcome = outcome,
            "Recorded run metric"
        );
    }

    pub fn record_judge_vote(&self, model: &str, valid: bool) {
        let validity = if valid { "valid" } else { "invalid" };
        if let Some(votes) = JUDGE_VOTES_TOTAL.get() {
            votes.with_label_values(&[model, validity]).inc();
        }
    }

    pub fn record_consensus_score(&self, score: f64) {
        if let Some(hist) = CONSENSUS_SCORE.get() {
            hist.observe(score);
        }
    }

    pub fn record_rate_limit_retry(&self, source: &str) {
        if let Some(retries) = RATE_LIMIT_RETRIES_TOTAL.get() {
            retries.with_label_values(&[source]).inc();
        }
    }

    /// `reused` is true when a checkpointed baseline was loaded instead of
    /// captured.
    pub fn record_baseline(&self, reused: bool) {
        let outcome = if reused { "reused" } else { "captured" };
        if let Some(captures) = BASELINE_CAPTURES_TOTAL.get() {
            captures.with_label_values(&[outcome]).inc();
        }
    }

    pub fn worker_started(&self) {
        if let Some(workers) = ACTIVE_WORKERS.get() {
            workers.inc();
        }
    }

    pub fn worker_finished(&self) {
        if let Some(workers) = ACTIVE_WORKERS.get() {
            workers.dec();
        }
    }
}

fn run_outcome(run: &RunResult) -> &'static str {
    if run.framework_error.is_some() {
        "framework_error"
    } else if run.passed() {
        "passed"
    } else {
        "failed"
    }
}
