//! Parsing judge verdicts.
//!
//! A present-but-null field is treated exactly like a missing one. Numeric
//! fields accept numbers and numeric strings; anything else falls back to the
//! field's default rather than failing the vote.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::rubric::{CategoryScores, ItemScore, Rubric};
use crate::pipeline::PipelineComparison;
use crate::rate_limit::RateLimitInfo;
use crate::utils::{truncate, try_extract_json_object};

/// One judge's vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResultSummary {
    pub model: String,
    pub score: f64,
    pub passed: bool,
    pub grade: String,
    pub reasoning: String,
    pub is_valid: bool,
    /// Rate-limit episode this judge recovered from before voting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
}

impl JudgeResultSummary {
    /// A vote excluded from consensus: score 0, not passed.
    pub fn invalid(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            score: 0.0,
            passed: false,
            grade: "F".to_string(),
            reasoning: reason.into(),
            is_valid: false,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(self, rate_limit: Option<RateLimitInfo>) -> Self {
        Self { rate_limit, ..self }
    }
}

/// Parses a judge's free-form output into a vote.
///
/// When the verdict carries per-item `categories`, the score is recomputed
/// from the rubric with pipeline stage overrides applied. Output without a
/// JSON object, or a raw score outside `[0, 1]`, is an invalid vote.
pub fn parse_verdict(
    model: &str,
    output: &str,
    rubric: &Rubric,
    comparison: &PipelineComparison,
) -> JudgeResultSummary {
    let obj = match try_extract_json_object(output) {
        Ok(obj) => obj,
        Err(e) => return JudgeResultSummary::invalid(model, truncate(&e.to_string(), 500)),
    };

    let item_scores = category_scores(field(&obj, "categories"));
    let score = match item_scores {
        Some(mut scores) => {
            rubric.apply_stage_overrides(comparison, &mut scores);
            rubric.score(&scores).clamp(0.0, 1.0)
        }
        None => number(field(&obj, "score")).unwrap_or(0.0),
    };
    if !(0.0..=1.0).contains(&score) {
        warn!(judge = model, score, "Judge score outside [0, 1], recording invalid vote");
        return JudgeResultSummary::invalid(model, format!("score {score} outside [0, 1]"));
    }

    let passed = boolean(field(&obj, "passed")).unwrap_or_else(|| rubric.passes(score));
    let grade = text(field(&obj, "grade"))
        .filter(|g| !g.trim().is_empty())
        .unwrap_or_else(|| rubric.grade_for(score));
    let reasoning = text(field(&obj, "reasoning")).unwrap_or_default();

    JudgeResultSummary {
        model: model.to_string(),
        score,
        passed,
        grade,
        reasoning,
        is_valid: true,
        rate_limit: None,
    }
}

/// The field's value, with `null` mapped to absent.
fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn boolean(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "pass" | "passed" => Some(true),
            "false" | "no" | "fail" | "failed" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn item_score(value: &Value) -> Option<ItemScore> {
    match value {
        Value::String(s) if is_not_applicable(s) => Some(ItemScore::NotApplicable),
        other => number(Some(other)).map(ItemScore::Points),
    }
}

fn is_not_applicable(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "n/a" | "na" | "not applicable")
}

/// Per-item scores from `{category: {items: {id: score}}}`, also accepting
/// `{category: {id: score}}`. `None` when absent or empty.
fn category_scores(value: Option<&Value>) -> Option<BTreeMap<String, CategoryScores>> {
    let categories = value?.as_object()?;
    let mut out = BTreeMap::new();

    for (name, body) in categories {
        let Some(body) = body.as_object() else { continue };
        let items = match body.get("items").and_then(Value::as_object) {
            Some(items) => items,
            None => body,
        };
        let scores: CategoryScores = items
            .iter()
            .filter_map(|(id, v)| item_score(v).map(|s| (id.clone(), s)))
            .collect();
        out.insert(name.clone(), scores);
    }

    (!out.is_empty()).then_some(out)
}
