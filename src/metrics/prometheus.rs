//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by tierbench and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all tierbench metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total agent runs, labeled by tier and outcome (passed, failed, framework_error).
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agent run duration in seconds, labeled by tier.
pub static RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Agent tokens used, labeled by tier and type (input/output).
pub static AGENT_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agent cost in US cents, labeled by tier.
pub static AGENT_COST_CENTS: OnceLock<CounterVec> = OnceLock::new();

/// Judge votes, labeled by judge model and validity.
pub static JUDGE_VOTES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of consensus scores.
pub static CONSENSUS_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Rate-limit retries, labeled by source (agent/judge).
pub static RATE_LIMIT_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Baseline pipeline captures, labeled by outcome (captured/reused).
pub static BASELINE_CAPTURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of workers currently running a unit of work.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("tierbench_runs_total", "Total agent runs"),
        &["tier", "outcome"],
    )?;

    let run_duration = HistogramVec::new(
        prometheus::HistogramOpts::new("tierbench_run_duration_seconds", "Agent run duration in seconds")
            .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["tier"],
    )?;

    let agent_tokens_total = CounterVec::new(
        Opts::new("tierbench_agent_tokens_total", "Total agent tokens used"),
        &["tier", "type"],
    )?;

    let agent_cost_cents = CounterVec::new(
        Opts::new("tierbench_agent_cost_cents", "Agent costs in cents"),
        &["tier"],
    )?;

    let judge_votes_total = CounterVec::new(
        Opts::new("tierbench_judge_votes_total", "Total judge votes"),
        &["model", "validity"],
    )?;

    let consensus_score = Histogram::with_opts(
        prometheus::HistogramOpts::new("tierbench_consensus_score", "Distribution of consensus scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let rate_limit_retries_total = CounterVec::new(
        Opts::new("tierbench_rate_limit_retries_total", "Total rate-limit retries"),
        &["source"],
    )?;

    let baseline_captures_total = CounterVec::new(
        Opts::new("tierbench_baseline_captures_total", "Baseline pipeline captures"),
        &["outcome"],
    )?;

    let active_workers = Gauge::new("tierbench_active_workers", "Number of active workers")?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(agent_tokens_total.clone()))?;
    registry.register(Box::new(agent_cost_cents.clone()))?;
    registry.register(Box::new(judge_votes_total.clone()))?;
    registry.register(Box::new(consensus_score.clone()))?;
    registry.register(Box::new(rate_limit_retries_total.clone()))?;
    registry.register(Box::new(baseline_captures_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set statics mean metrics were initialized earlier.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = AGENT_TOKENS_TOTAL.set(agent_tokens_total);
    let _ = AGENT_COST_CENTS.set(agent_cost_cents);
    let _ = JUDGE_VOTES_TOTAL.set(judge_votes_total);
    let _ = CONSENSUS_SCORE.set(consensus_score);
    let _ = RATE_LIMIT_RETRIES_TOTAL.set(rate_limit_retries_total);
    let _ = BASELINE_CAPTURES_TOTAL.set(baseline_captures_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
