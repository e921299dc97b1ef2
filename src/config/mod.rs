//! Experiment configuration.
//!
//! An [`ExperimentConfig`] is loaded once from YAML, adjusted by environment
//! overrides, validated, and then shared read-only by every component.
//!
//! # Environment Variables
//!
//! - `TIERBENCH_MAX_WORKERS`: bounded worker pool size
//! - `TIERBENCH_RESULTS_DIR`: root directory for checkpoints and results
//! - `TIERBENCH_AGENT_TIMEOUT_SECS`: agent subprocess timeout
//! - `TIERBENCH_JUDGE_TIMEOUT_SECS`: judge subprocess timeout
//! - `TIERBENCH_PRESERVE_WORKSPACES`: keep worktrees after runs (debugging)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::judge::Rubric;
use crate::rate_limit::BackoffPolicy;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Capabilities handed to the agent under test: prompt, skills, tools and
/// sub-agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityBundle {
    pub system_prompt: Option<String>,
    pub skills: Vec<String>,
    pub tools: Vec<String>,
    pub sub_agents: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CapabilityBundle {
    /// Layers `overlay` on top of `self`.
    ///
    /// Lists are unioned in order without duplicates, prompts are joined and
    /// `overlay` wins on environment key conflicts.
    pub fn merge(&self, overlay: &CapabilityBundle) -> CapabilityBundle {
        fn union(a: &[String], b: &[String]) -> Vec<String> {
            let mut out: Vec<String> = Vec::with_capacity(a.len() + b.len());
            for item in a.iter().chain(b) {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            out
        }

        let system_prompt = match (&self.system_prompt, &overlay.system_prompt) {
            (Some(a), Some(b)) if a != b => Some(format!("{a}\n\n{b}")),
            (Some(a), _) => Some(a.clone()),
            (None, b) => b.clone(),
        };

        let mut env = self.env.clone();
        env.extend(overlay.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        CapabilityBundle {
            system_prompt,
            skills: union(&self.skills, &overlay.skills),
            tools: union(&self.tools, &overlay.tools),
            sub_agents: union(&self.sub_agents, &overlay.sub_agents),
            env,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.system_prompt.is_none()
            && self.skills.is_empty()
            && self.tools.is_empty()
            && self.sub_agents.is_empty()
            && self.env.is_empty()
    }
}

/// One capability configuration within a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTestDefinition {
    pub id: String,
    /// Overrides the experiment task prompt.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub capabilities: CapabilityBundle,
}

impl SubTestDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: None,
            capabilities: CapabilityBundle::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityBundle) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

/// A named capability tier (T0..T6) and its subtests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: CapabilityBundle,
    pub subtests: Vec<SubTestDefinition>,
    /// Tiers whose lowest Cost-of-Pass subtest this tier builds on.
    #[serde(default)]
    pub inherit_best_from: Vec<String>,
}

impl TierDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            capabilities: CapabilityBundle::default(),
            subtests: Vec::new(),
            inherit_best_from: Vec::new(),
        }
    }

    pub fn with_subtest(mut self, subtest: SubTestDefinition) -> Self {
        self.subtests.push(subtest);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityBundle) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn inheriting_from(mut self, tier: impl Into<String>) -> Self {
        self.inherit_best_from.push(tier.into());
        self
    }

    pub fn subtest(&self, id: &str) -> Option<&SubTestDefinition> {
        self.subtests.iter().find(|s| s.id == id)
    }
}

/// How the agent executable is launched.
///
/// `args` may contain the placeholders `{prompt_file}`, `{workspace}`,
/// `{model}` and `{capabilities_file}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

impl AgentSettings {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            model: None,
            timeout_secs: default_agent_timeout_secs(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Rule turning valid judge votes into a pass/fail verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassRule {
    /// Consensus score at or above the rubric pass threshold.
    #[default]
    ScoreThreshold,
    /// More than half of the valid votes passed.
    Majority,
}

/// How judge executables are launched and reconciled.
///
/// One judge process is invoked per entry in `models`. `args` accepts the
/// placeholders `{prompt_file}`, `{workspace}` and `{model}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub models: Vec<String>,
    #[serde(default = "default_judge_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_max_score_spread")]
    pub max_score_spread: f64,
    #[serde(default)]
    pub pass_rule: PassRule,
}

fn default_judge_timeout_secs() -> u64 {
    600
}

fn default_max_rounds() -> u32 {
    3
}

fn default_max_score_spread() -> f64 {
    0.3
}

impl JudgeSettings {
    pub const MAX_ROUNDS_LIMIT: u32 = 5;

    pub fn new<I, S>(command: impl Into<String>, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: Vec::new(),
            models: models.into_iter().map(Into::into).collect(),
            timeout_secs: default_judge_timeout_secs(),
            max_rounds: default_max_rounds(),
            max_score_spread: default_max_score_spread(),
            pass_rule: PassRule::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pass_rule(mut self, rule: PassRule) -> Self {
        self.pass_rule = rule;
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_max_score_spread(mut self, spread: f64) -> Self {
        self.max_score_spread = spread;
        self
    }

    /// `max_rounds` clamped to `1..=5`.
    pub fn effective_max_rounds(&self) -> u32 {
        self.max_rounds.clamp(1, Self::MAX_ROUNDS_LIMIT)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Shell commands for the build/lint/test pipeline. Unset stages are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCommands {
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default = "default_pipeline_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_pipeline_timeout_secs() -> u64 {
    600
}

impl Default for PipelineCommands {
    fn default() -> Self {
        Self {
            build: None,
            lint: None,
            test: None,
            timeout_secs: default_pipeline_timeout_secs(),
        }
    }
}

impl PipelineCommands {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Immutable description of one benchmarking experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    /// Git repository every workspace is branched from.
    pub base_repo: PathBuf,
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    /// Task prompt given to the agent.
    pub task: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_runs_per_subtest")]
    pub runs_per_subtest: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Tier ids to run; empty means all.
    #[serde(default)]
    pub tiers_to_run: Vec<String>,
    pub tiers: Vec<TierDefinition>,
    pub agent: AgentSettings,
    pub judge: JudgeSettings,
    #[serde(default)]
    pub pipeline: PipelineCommands,
    #[serde(default)]
    pub rubric_path: Option<PathBuf>,
    #[serde(default)]
    pub rubric: Option<Rubric>,
    #[serde(default)]
    pub preserve_workspaces: bool,
    #[serde(default)]
    pub rate_limit: BackoffPolicy,
}

fn default_base_ref() -> String {
    "HEAD".to_string()
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("tierbench-workspaces")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results")
}

fn default_runs_per_subtest() -> u32 {
    10
}

fn default_max_workers() -> usize {
    4
}

impl ExperimentConfig {
    /// Creates a configuration with defaults for everything but the
    /// essentials.
    pub fn new(
        experiment_id: impl Into<String>,
        base_repo: impl Into<PathBuf>,
        task: impl Into<String>,
        agent: AgentSettings,
        judge: JudgeSettings,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            base_repo: base_repo.into(),
            base_ref: default_base_ref(),
            task: task.into(),
            workspace_root: default_workspace_root(),
            results_dir: default_results_dir(),
            runs_per_subtest: default_runs_per_subtest(),
            max_workers: default_max_workers(),
            tiers_to_run: Vec::new(),
            tiers: Vec::new(),
            agent,
            judge,
            pipeline: PipelineCommands::default(),
            rubric_path: None,
            rubric: None,
            preserve_workspaces: false,
            rate_limit: BackoffPolicy::default(),
        }
    }

    pub fn with_tier(mut self, tier: TierDefinition) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = Some(rubric);
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineCommands) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_runs_per_subtest(mut self, runs: u32) -> Self {
        self.runs_per_subtest = runs;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_workspace_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_root = dir.into();
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn with_tiers_to_run<I, S>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tiers_to_run = tiers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rate_limit(mut self, policy: BackoffPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    pub fn preserving_workspaces(mut self, preserve: bool) -> Self {
        self.preserve_workspaces = preserve;
        self
    }

    /// Loads, resolves the rubric, applies environment overrides and
    /// validates.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ExperimentConfig = serde_yaml::from_str(&text)?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base_dir);
        config.load_rubric()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &Path| {
            if p.is_relative() {
                base_dir.join(p)
            } else {
                p.to_path_buf()
            }
        };
        self.base_repo = resolve(&self.base_repo);
        self.rubric_path = self.rubric_path.as_deref().map(resolve);
    }

    /// Reads `rubric_path` when no rubric is inlined.
    pub fn load_rubric(&mut self) -> Result<(), ConfigError> {
        if self.rubric.is_none() {
            if let Some(path) = &self.rubric_path {
                self.rubric = Some(Rubric::from_yaml_file(path)?);
            }
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("TIERBENCH_MAX_WORKERS") {
            self.max_workers = parse_env_value(&val, "TIERBENCH_MAX_WORKERS")?;
        }
        if let Some(val) = lookup("TIERBENCH_RESULTS_DIR") {
            self.results_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("TIERBENCH_AGENT_TIMEOUT_SECS") {
            self.agent.timeout_secs = parse_env_value(&val, "TIERBENCH_AGENT_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("TIERBENCH_JUDGE_TIMEOUT_SECS") {
            self.judge.timeout_secs = parse_env_value(&val, "TIERBENCH_JUDGE_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("TIERBENCH_PRESERVE_WORKSPACES") {
            self.preserve_workspaces = parse_env_bool(&val, "TIERBENCH_PRESERVE_WORKSPACES")?;
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` or
    /// `ConfigError::InvalidIdentifier` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("experiment_id", &self.experiment_id)?;

        if self.task.trim().is_empty() {
            return Err(ConfigError::ValidationFailed("task cannot be empty".to_string()));
        }
        if self.runs_per_subtest == 0 {
            return Err(ConfigError::ValidationFailed(
                "runs_per_subtest must be greater than 0".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed("agent.command cannot be empty".to_string()));
        }
        if self.agent.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "agent.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.judge.command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed("judge.command cannot be empty".to_string()));
        }
        if self.judge.models.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "judge.models must list at least one judge".to_string(),
            ));
        }
        if self.judge.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "judge.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if !self.judge.max_score_spread.is_finite() || self.judge.max_score_spread < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "judge.max_score_spread must be a non-negative number".to_string(),
            ));
        }
        if self.pipeline.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "pipeline.timeout_secs must be greater than 0".to_string(),
            ));
        }
        self.rate_limit.validate()?;

        match &self.rubric {
            Some(rubric) => rubric.validate()?,
            None => {
                return Err(ConfigError::ValidationFailed(
                    "a rubric is required (inline `rubric` or `rubric_path`)".to_string(),
                ))
            }
        }

        if self.tiers.is_empty() {
            return Err(ConfigError::ValidationFailed("at least one tier is required".to_string()));
        }

        let mut tier_ids = HashSet::new();
        for tier in &self.tiers {
            validate_identifier("tier id", &tier.id)?;
            if !tier_ids.insert(tier.id.as_str()) {
                return Err(ConfigError::ValidationFailed(format!("duplicate tier id '{}'", tier.id)));
            }
            if tier.subtests.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "tier '{}' has no subtests",
                    tier.id
                )));
            }
            let mut subtest_ids = HashSet::new();
            for subtest in &tier.subtests {
                validate_identifier("subtest id", &subtest.id)?;
                if !subtest_ids.insert(subtest.id.as_str()) {
                    return Err(ConfigError::ValidationFailed(format!(
                        "duplicate subtest id '{}' in tier '{}'",
                        subtest.id, tier.id
                    )));
                }
            }
        }

        for id in &self.tiers_to_run {
            if !tier_ids.contains(id.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "tiers_to_run references unknown tier '{id}'"
                )));
            }
        }

        dependency_waves(&self.tiers)?;
        Ok(())
    }

    pub fn tier(&self, id: &str) -> Option<&TierDefinition> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// Tiers selected by `tiers_to_run`, in declaration order.
    pub fn selected_tiers(&self) -> Vec<&TierDefinition> {
        self.tiers
            .iter()
            .filter(|t| self.tiers_to_run.is_empty() || self.tiers_to_run.contains(&t.id))
            .collect()
    }

    /// Directory holding checkpoints and results for this experiment.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.results_dir.join(&self.experiment_id)
    }

    pub fn rubric(&self) -> Result<&Rubric, ConfigError> {
        self.rubric
            .as_ref()
            .ok_or_else(|| ConfigError::ValidationFailed("rubric not loaded".to_string()))
    }

    /// SHA-256 over everything that determines results.
    ///
    /// Operational knobs (worker count, tier selection, output locations,
    /// workspace preservation) are excluded so a resume may change them.
    pub fn digest(&self) -> String {
        let mut canonical = self.clone();
        canonical.max_workers = 0;
        canonical.tiers_to_run.clear();
        canonical.results_dir = PathBuf::new();
        canonical.workspace_root = PathBuf::new();
        canonical.preserve_workspaces = false;
        canonical.rubric_path = None;
        canonical.agent.timeout_secs = 0;
        canonical.judge.timeout_secs = 0;
        canonical.rate_limit = BackoffPolicy::default();

        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Checks that an identifier is safe to embed in branch names and paths.
///
/// Identifiers are validated, never rewritten, so distinct inputs always
/// produce distinct workspace identifiers.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidIdentifier {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("must be at most 64 characters"));
    }
    if value.starts_with('-') || value.starts_with('.') {
        return Err(invalid("must not start with '-' or '.'"));
    }
    if value.contains("..") {
        return Err(invalid("must not contain '..'"));
    }
    if value.ends_with(".lock") {
        return Err(invalid("must not end with '.lock'"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("may only contain [A-Za-z0-9._-]"));
    }
    Ok(())
}

/// Groups tiers into dependency waves via `inherit_best_from`.
///
/// Every tier in a wave depends only on tiers in earlier waves. Unknown
/// dependencies, self-references and cycles are rejected.
pub fn dependency_waves(tiers: &[TierDefinition]) -> Result<Vec<Vec<String>>, ConfigError> {
    let known: HashSet<&str> = tiers.iter().map(|t| t.id.as_str()).collect();
    let mut pending: HashMap<&str, HashSet<&str>> = HashMap::new();

    for tier in tiers {
        let mut deps = HashSet::new();
        for dep in &tier.inherit_best_from {
            if dep == &tier.id {
                return Err(ConfigError::ValidationFailed(format!(
                    "tier '{}' cannot inherit from itself",
                    tier.id
                )));
            }
            if !known.contains(dep.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "tier '{}' inherits from unknown tier '{}'",
                    tier.id, dep
                )));
            }
            deps.insert(dep.as_str());
        }
        pending.insert(tier.id.as_str(), deps);
    }

    let mut waves = Vec::new();
    let mut done: HashSet<&str> = HashSet::new();
    while !pending.is_empty() {
        // Keep declaration order within a wave.
        let ready: Vec<&str> = tiers
            .iter()
            .map(|t| t.id.as_str())
            .filter(|id| {
                pending
                    .get(id)
                    .is_some_and(|deps| deps.iter().all(|d| done.contains(d)))
            })
            .collect();

        if ready.is_empty() {
            let mut stuck: Vec<&str> = pending.keys().copied().collect();
            stuck.sort_unstable();
            return Err(ConfigError::ValidationFailed(format!(
                "tier inheritance cycle among: {}",
                stuck.join(", ")
            )));
        }

        for id in &ready {
            pending.remove(id);
            done.insert(*id);
        }
        waves.push(ready.into_iter().map(String::from).collect());
    }

    Ok(waves)
}

fn parse_env_value<T: FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{val}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUBRIC: &str = r#"
categories:
  - name: functional
    scoring_type: checklist
    items:
      - { id: F1, description: "Works" }
"#;

    fn config() -> ExperimentConfig {
        ExperimentConfig::new(
            "exp-1",
            "/tmp/repo",
            "Fix the bug",
            AgentSettings::new("agent"),
            JudgeSettings::new("judge", ["m1", "m2", "m3"]),
        )
        .with_rubric(Rubric::from_yaml_str(RUBRIC).unwrap())
        .with_tier(TierDefinition::new("T0").with_subtest(SubTestDefinition::new("00")))
        .with_tier(
            TierDefinition::new("T1")
                .with_subtest(SubTestDefinition::new("01"))
                .with_subtest(SubTestDefinition::new("02")),
        )
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("id", "T0").is_ok());
        assert!(validate_identifier("id", "exp_2024.01-a").is_ok());
        assert!(validate_identifier("id", "").is_err());
        assert!(validate_identifier("id", "-x").is_err());
        assert!(validate_identifier("id", ".hidden").is_err());
        assert!(validate_identifier("id", "a..b").is_err());
        assert!(validate_identifier("id", "a/b").is_err());
        assert!(validate_identifier("id", "a b").is_err());
        assert!(validate_identifier("id", "x.lock").is_err());
        assert!(validate_identifier("id", &"a".repeat(65)).is_err());
    }

    #[test]
    fn test_rejects_zero_runs_and_workers() {
        assert!(config().with_runs_per_subtest(0).validate().is_err());
        assert!(config().with_max_workers(0).validate().is_err());
    }

    #[test]
    fn test_rejects_missing_rubric() {
        let mut cfg = config();
        cfg.rubric = None;
        assert!(matches!(cfg.validate(), Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_rejects_duplicate_subtests() {
        let cfg = config().with_tier(
            TierDefinition::new("T2")
                .with_subtest(SubTestDefinition::new("a"))
                .with_subtest(SubTestDefinition::new("a")),
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_dependency_waves() {
        let cfg = config().with_tier(
            TierDefinition::new("T2")
                .with_subtest(SubTestDefinition::new("a"))
                .inheriting_from("T0")
                .inheriting_from("T1"),
        );
        let waves = dependency_waves(&cfg.tiers).unwrap();
        assert_eq!(waves, vec![vec!["T0".to_string(), "T1".to_string()], vec!["T2".to_string()]]);
    }

    #[test]
    fn test_dependency_cycle_and_unknown() {
        let tiers = vec![
            TierDefinition::new("A").inheriting_from("B"),
            TierDefinition::new("B").inheriting_from("A"),
        ];
        assert!(dependency_waves(&tiers).is_err());

        let tiers = vec![TierDefinition::new("A").inheriting_from("Z")];
        assert!(dependency_waves(&tiers).is_err());

        let tiers = vec![TierDefinition::new("A").inheriting_from("A")];
        assert!(dependency_waves(&tiers).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = config();
        let vars: HashMap<&str, &str> = [
            ("TIERBENCH_MAX_WORKERS", "8"),
            ("TIERBENCH_JUDGE_TIMEOUT_SECS", "30"),
            ("TIERBENCH_PRESERVE_WORKSPACES", "yes"),
        ]
        .into_iter()
        .collect();
        cfg.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.judge.timeout_secs, 30);
        assert!(cfg.preserve_workspaces);
    }

    #[test]
    fn test_env_override_invalid_value() {
        let mut cfg = config();
        let err = cfg
            .apply_overrides_from(|k| (k == "TIERBENCH_MAX_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_digest_ignores_operational_knobs() {
        let a = config();
        let b = config().with_max_workers(16).with_tiers_to_run(["T0"]);
        assert_eq!(a.digest(), b.digest());

        let c = config().with_runs_per_subtest(3);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_effective_max_rounds_clamped() {
        assert_eq!(JudgeSettings::new("j", ["m"]).with_max_rounds(0).effective_max_rounds(), 1);
        assert_eq!(JudgeSettings::new("j", ["m"]).with_max_rounds(9).effective_max_rounds(), 5);
        assert_eq!(JudgeSettings::new("j", ["m"]).effective_max_rounds(), 3);
    }

    #[test]
    fn test_capability_merge() {
        let base = CapabilityBundle {
            system_prompt: Some("Be careful.".to_string()),
            skills: vec!["git".to_string()],
            tools: vec!["bash".to_string()],
            ..Default::default()
        };
        let overlay = CapabilityBundle {
            system_prompt: Some("Write tests.".to_string()),
            skills: vec!["git".to_string(), "review".to_string()],
            ..Default::default()
        };
        let merged = base.merge(&overlay);
        assert_eq!(merged.skills, vec!["git", "review"]);
        assert_eq!(merged.tools, vec!["bash"]);
        assert_eq!(merged.system_prompt.as_deref(), Some("Be careful.\n\nWrite tests."));
    }

    #[test]
    fn test_from_yaml_file_with_rubric_path() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("rubric.yaml"), RUBRIC).unwrap();
        let yaml = r#"
experiment_id: exp-yaml
base_repo: repo
task: "Add a --verbose flag"
runs_per_subtest: 2
rubric_path: rubric.yaml
agent:
  command: claude
  args: ["-p", "{prompt_file}"]
judge:
  command: judge
  models: [a, b]
pipeline:
  build: "cargo build"
  test: "cargo test"
tiers:
  - id: T0
    subtests:
      - id: "00"
  - id: T1
    inherit_best_from: [T0]
    capabilities:
      tools: [web]
    subtests:
      - id: "01"
"#;
        let path = dir.path().join("experiment.yaml");
        std::fs::write(&path, yaml).unwrap();

        let cfg = ExperimentConfig::from_yaml_file(&path).unwrap();
        assert_eq!(cfg.experiment_id, "exp-yaml");
        assert_eq!(cfg.base_repo, dir.path().join("repo"));
        assert!(cfg.rubric.is_some());
        assert_eq!(cfg.judge.models.len(), 2);
        assert_eq!(cfg.tiers[1].inherit_best_from, vec!["T0"]);
        assert_eq!(cfg.pipeline.lint, None);
    }
}
