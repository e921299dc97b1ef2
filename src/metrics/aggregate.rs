//! Folding run results into subtest, tier and experiment statistics.
//!
//! Cost-of-Pass (CoP) is `mean_cost / pass_rate`. A subtest that never
//! passes has an infinite CoP and is never selected as a tier's winner.
//! Runs carrying a framework error are excluded from pass rate and cost and
//! counted separately.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::config::CapabilityBundle;
use crate::runner::RunResult;

/// Statistics for one subtest, derived from its runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTestResult {
    pub tier_id: String,
    pub subtest_id: String,
    /// Ordered by run number.
    pub runs: Vec<RunResult>,
    pub pass_rate: f64,
    pub mean_cost: f64,
    pub mean_score: f64,
    pub mean_duration_seconds: f64,
    pub framework_error_count: usize,
}

impl SubTestResult {
    pub fn new(tier_id: impl Into<String>, subtest_id: impl Into<String>) -> Self {
        Self {
            tier_id: tier_id.into(),
            subtest_id: subtest_id.into(),
            runs: Vec::new(),
            pass_rate: 0.0,
            mean_cost: 0.0,
            mean_score: 0.0,
            mean_duration_seconds: 0.0,
            framework_error_count: 0,
        }
    }

    pub fn from_runs(tier_id: impl Into<String>, subtest_id: impl Into<String>, runs: Vec<RunResult>) -> Self {
        let mut result = Self::new(tier_id, subtest_id);
        result.runs = runs;
        result.refresh();
        result
    }

    /// Adds or replaces the result for a run number.
    pub fn record(&mut self, run: RunResult) {
        match self.runs.iter_mut().find(|r| r.run_number == run.run_number) {
            Some(existing) => *existing = run,
            None => self.runs.push(run),
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        self.runs.sort_by_key(|r| r.run_number);
        self.framework_error_count = self.runs.iter().filter(|r| r.framework_error.is_some()).count();

        let (pass_rate, mean_cost, mean_score, mean_duration) = {
            let valid: Vec<&RunResult> = self.valid_runs().collect();
            if valid.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let n = valid.len() as f64;
                (
                    valid.iter().filter(|r| r.passed()).count() as f64 / n,
                    valid.iter().map(|r| r.cost_usd).sum::<f64>() / n,
                    valid.iter().map(|r| r.score()).sum::<f64>() / n,
                    valid.iter().map(|r| r.execution.duration_seconds).sum::<f64>() / n,
                )
            }
        };
        self.pass_rate = pass_rate;
        self.mean_cost = mean_cost;
        self.mean_score = mean_score;
        self.mean_duration_seconds = mean_duration;
    }

    /// Runs without a framework error.
    pub fn valid_runs(&self) -> impl Iterator<Item = &RunResult> {
        self.runs.iter().filter(|r| r.framework_error.is_none())
    }

    /// `mean_cost / pass_rate`; infinite when nothing passed.
    pub fn cost_of_pass(&self) -> f64 {
        if self.pass_rate <= 0.0 {
            f64::INFINITY
        } else {
            self.mean_cost / self.pass_rate
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.runs.iter().map(|r| r.cost_usd).sum()
    }
}

/// Subtest results of one tier and its winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierResult {
    pub tier_id: String,
    pub subtests: BTreeMap<String, SubTestResult>,
    /// Subtest with the lowest finite Cost-of-Pass.
    pub best_subtest: Option<String>,
    /// `(tier, subtest)` whose capabilities this tier inherited.
    #[serde(default)]
    pub inherited_from: Option<(String, String)>,
    /// Tier-level bundle the subtests were layered on, inheritance included.
    #[serde(default)]
    pub capabilities: CapabilityBundle,
    pub completed_at: DateTime<Utc>,
}

impl TierResult {
    pub fn new(tier_id: impl Into<String>, subtests: BTreeMap<String, SubTestResult>) -> Self {
        let best_subtest = best_by_cost_of_pass(subtests.values()).map(|s| s.subtest_id.clone());
        Self {
            tier_id: tier_id.into(),
            subtests,
            best_subtest,
            inherited_from: None,
            capabilities: CapabilityBundle::default(),
            completed_at: Utc::now(),
        }
    }

    pub fn with_inherited_from(mut self, tier: impl Into<String>, subtest: impl Into<String>) -> Self {
        self.inherited_from = Some((tier.into(), subtest.into()));
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityBundle) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn best(&self) -> Option<&SubTestResult> {
        self.best_subtest.as_ref().and_then(|id| self.subtests.get(id))
    }

    pub fn run_count(&self) -> usize {
        self.subtests.values().map(|s| s.runs.len()).sum()
    }

    pub fn framework_error_count(&self) -> usize {
        self.subtests.values().map(|s| s.framework_error_count).sum()
    }

    /// True when every run in the tier hit a framework error.
    pub fn all_runs_failed(&self) -> bool {
        let runs = self.run_count();
        runs > 0 && self.framework_error_count() == runs
    }

    pub fn total_cost(&self) -> f64 {
        self.subtests.values().map(|s| s.total_cost()).sum()
    }
}

/// Lowest finite CoP; ties go to the first candidate.
fn best_by_cost_of_pass<'a>(candidates: impl Iterator<Item = &'a SubTestResult>) -> Option<&'a SubTestResult> {
    let mut best: Option<(&SubTestResult, OrderedFloat<f64>)> = None;
    for candidate in candidates {
        let cop = candidate.cost_of_pass();
        if !cop.is_finite() {
            continue;
        }
        let cop = OrderedFloat(cop);
        if best.as_ref().map_or(true, |(_, b)| cop < *b) {
            best = Some((candidate, cop));
        }
    }
    best.map(|(s, _)| s)
}

/// A subtest selected as the cheapest reliable configuration across tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct Winner {
    pub tier_id: String,
    pub subtest_id: String,
    pub cost_of_pass: f64,
}

/// Everything an experiment produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub experiment_id: String,
    pub tiers: BTreeMap<String, TierResult>,
    /// Tier id to failure reason.
    pub failed_tiers: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExperimentResult {
    pub fn is_partial(&self) -> bool {
        !self.failed_tiers.is_empty()
    }

    /// Plain-text summary table.
    pub fn summary(&self) -> String {
        let mut out = format!("Experiment {}\n", self.experiment_id);
        out.push_str(&format!(
            "{:<10} {:<10} {:>5} {:>9} {:>10} {:>10} {:>7}\n",
            "tier", "subtest", "runs", "pass_rate", "mean_cost", "cop", "errors"
        ));
        for tier in self.tiers.values() {
            for sub in tier.subtests.values() {
                let marker = if tier.best_subtest.as_deref() == Some(sub.subtest_id.as_str()) {
                    "*"
                } else {
                    ""
                };
                let cop = sub.cost_of_pass();
                let cop = if cop.is_finite() { format!("{cop:.4}") } else { "inf".to_string() };
                out.push_str(&format!(
                    "{:<10} {:<10} {:>5} {:>9.2} {:>10.4} {:>10} {:>7}\n",
                    tier.tier_id,
                    format!("{}{}", sub.subtest_id, marker),
                    sub.runs.len(),
                    sub.pass_rate,
                    sub.mean_cost,
                    cop,
                    sub.framework_error_count
                ));
            }
        }
        for (tier, reason) in &self.failed_tiers {
            out.push_str(&format!("{tier}: FAILED ({reason})\n"));
        }
        out
    }
}

/// Accumulates run results and folds them into statistics.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    subtests: BTreeMap<(String, String), SubTestResult>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, run: RunResult) {
        let key = (run.tier_id.clone(), run.subtest_id.clone());
        self.subtests
            .entry(key)
            .or_insert_with(|| SubTestResult::new(&run.tier_id, &run.subtest_id))
            .record(run);
    }

    pub fn subtest(&self, tier_id: &str, subtest_id: &str) -> Option<&SubTestResult> {
        self.subtests.get(&(tier_id.to_string(), subtest_id.to_string()))
    }

    /// Finalizes the tier from every subtest recorded for it.
    pub fn tier_result(&self, tier_id: &str) -> TierResult {
        let subtests = self
            .subtests
            .iter()
            .filter(|((tier, _), _)| tier == tier_id)
            .map(|((_, subtest), result)| (subtest.clone(), result.clone()))
            .collect();
        TierResult::new(tier_id, subtests)
    }

    /// Lowest finite-CoP winner across the given tiers, or `None` when no
    /// subtest ever passed.
    pub fn select_winner<'a>(tiers: impl IntoIterator<Item = &'a TierResult>) -> Option<Winner> {
        let winners: Vec<&SubTestResult> = tiers.into_iter().filter_map(|t| t.best()).collect();
        best_by_cost_of_pass(winners.into_iter()).map(|s| Winner {
            tier_id: s.tier_id.clone(),
            subtest_id: s.subtest_id.clone(),
            cost_of_pass: s.cost_of_pass(),
        })
    }
}
