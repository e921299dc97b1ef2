//! Hybrid rubric: checklist and subjective categories, weighted scoring,
//! not-applicable handling and letter grades.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::{PipelineComparison, Stage, StageDelta};

/// How a category's items are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringType {
    /// Each item earns any fraction of its `max_points`.
    Checklist,
    /// Continuous scale guided by textual anchors.
    Subjective,
}

/// Textual description of what a given score level means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub score: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricItem {
    pub id: String,
    pub description: String,
    #[serde(default = "default_max_points")]
    pub max_points: f64,
    /// Pipeline stage this item depends on, if any.
    #[serde(default)]
    pub stage: Option<Stage>,
}

fn default_max_points() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricCategory {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub scoring_type: ScoringType,
    pub items: Vec<RubricItem>,
    #[serde(default)]
    pub anchors: Vec<Anchor>,
}

fn default_weight() -> f64 {
    1.0
}

/// A judge's verdict on a single item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ItemScore {
    Points(f64),
    NotApplicable,
}

/// Item scores for one category, keyed by item id.
pub type CategoryScores = BTreeMap<String, ItemScore>;

impl RubricCategory {
    /// Normalized score in `[0, 1]`, or `None` when every item is N/A.
    ///
    /// N/A items leave both the achieved total and the possible total. Items
    /// missing from `scores` earn zero.
    pub fn score(&self, scores: &CategoryScores) -> Option<f64> {
        let mut achieved = 0.0;
        let mut possible = 0.0;

        for item in &self.items {
            match scores.get(&item.id) {
                Some(ItemScore::NotApplicable) => continue,
                Some(ItemScore::Points(points)) => {
                    let points = if points.is_finite() { *points } else { 0.0 };
                    achieved += points.clamp(0.0, item.max_points);
                    possible += item.max_points;
                }
                None => possible += item.max_points,
            }
        }

        (possible > 0.0).then(|| achieved / possible)
    }
}

/// One letter grade and the minimum score that earns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub grade: String,
    pub min_score: f64,
}

/// Ordered score-to-grade mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradeScale(pub Vec<GradeBand>);

impl Default for GradeScale {
    fn default() -> Self {
        let bands = [("S", 1.0), ("A", 0.8), ("B", 0.6), ("C", 0.4), ("D", 0.2), ("F", 0.0)];
        Self(
            bands
                .iter()
                .map(|(grade, min_score)| GradeBand {
                    grade: grade.to_string(),
                    min_score: *min_score,
                })
                .collect(),
        )
    }
}

impl GradeScale {
    const EPSILON: f64 = 1e-9;

    pub fn grade_for(&self, score: f64) -> String {
        let mut bands: Vec<&GradeBand> = self.0.iter().collect();
        bands.sort_by(|a, b| b.min_score.total_cmp(&a.min_score));
        bands
            .iter()
            .find(|band| score + Self::EPSILON >= band.min_score)
            .or_else(|| bands.last())
            .map(|band| band.grade.clone())
            .unwrap_or_else(|| "F".to_string())
    }

    /// Lowest grade on the scale.
    pub fn lowest(&self) -> String {
        self.0
            .iter()
            .min_by(|a, b| a.min_score.total_cmp(&b.min_score))
            .map(|band| band.grade.clone())
            .unwrap_or_else(|| "F".to_string())
    }
}

/// The grading rubric handed to every judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub categories: Vec<RubricCategory>,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default)]
    pub grade_scale: GradeScale,
}

fn default_pass_threshold() -> f64 {
    0.6
}

impl Rubric {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let rubric: Rubric = serde_yaml::from_str(yaml)?;
        rubric.validate()?;
        Ok(rubric)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationFailed(msg));

        if self.categories.is_empty() {
            return fail("rubric must define at least one category".to_string());
        }
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return fail(format!(
                "rubric pass_threshold must be within [0, 1], got {}",
                self.pass_threshold
            ));
        }
        if self.grade_scale.0.is_empty() {
            return fail("rubric grade_scale must not be empty".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for category in &self.categories {
            if !names.insert(category.name.as_str()) {
                return fail(format!("duplicate rubric category '{}'", category.name));
            }
            if !category.weight.is_finite() || category.weight <= 0.0 {
                return fail(format!("category '{}' must have a positive weight", category.name));
            }
            if category.items.is_empty() {
                return fail(format!("category '{}' has no items", category.name));
            }
            let mut ids = std::collections::HashSet::new();
            for item in &category.items {
                if !ids.insert(item.id.as_str()) {
                    return fail(format!("duplicate item '{}' in category '{}'", item.id, category.name));
                }
                if !item.max_points.is_finite() || item.max_points <= 0.0 {
                    return fail(format!("item '{}' must have positive max_points", item.id));
                }
            }
        }
        Ok(())
    }

    pub fn category(&self, name: &str) -> Option<&RubricCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// Weighted mean of applicable category scores, in `[0, 1]`.
    ///
    /// Categories that are entirely N/A drop out of the weighting. With no
    /// applicable category at all the score is 0.
    pub fn score(&self, scores: &BTreeMap<String, CategoryScores>) -> f64 {
        let empty = CategoryScores::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for category in &self.categories {
            let items = scores.get(&category.name).unwrap_or(&empty);
            if let Some(normalized) = category.score(items) {
                weighted += normalized * category.weight;
                total_weight += category.weight;
            }
        }

        if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        }
    }

    /// Forces stage-bound items to N/A for pre-existing failures and to zero
    /// for regressions.
    pub fn apply_stage_overrides(
        &self,
        comparison: &PipelineComparison,
        scores: &mut BTreeMap<String, CategoryScores>,
    ) {
        for category in &self.categories {
            for item in &category.items {
                let Some(stage) = item.stage else { continue };
                let forced = match comparison.delta(stage) {
                    StageDelta::PreExisting => ItemScore::NotApplicable,
                    StageDelta::Regression => ItemScore::Points(0.0),
                    _ => continue,
                };
                scores
                    .entry(category.name.clone())
                    .or_default()
                    .insert(item.id.clone(), forced);
            }
        }
    }

    pub fn passes(&self, score: f64) -> bool {
        score + GradeScale::EPSILON >= self.pass_threshold
    }

    pub fn grade_for(&self, score: f64) -> String {
        self.grade_scale.grade_for(score)
    }
}
