//! CLI command definitions for tierbench.
//!
//! `run` starts (or continues) an experiment, `resume` continues one that
//! must already have a checkpoint, and `status` summarizes a checkpoint tree
//! without running anything.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::ExperimentConfig;
use crate::metrics::export_metrics;
use crate::scheduler::TierOrchestrator;
use crate::shutdown::Shutdown;

/// File the Prometheus exposition is written to, inside the checkpoint dir.
const METRICS_FILE: &str = "metrics.prom";

/// Tiered benchmarking harness for autonomous coding agents.
#[derive(Parser)]
#[command(name = "tierbench")]
#[command(about = "Measure what capability scaffolding costs and buys a coding agent")]
#[command(version)]
#[command(
    long_about = "tierbench runs a coding agent under several capability tiers, grades every run with a panel of judges against a rubric and pre/post build pipeline snapshots, and reports pass rate and Cost-of-Pass per tier.\n\nExample usage:\n  tierbench run --config experiment.yaml --tiers T0,T1 --max-workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run an experiment, reusing any completed work in its checkpoint.
    Run(RunArgs),

    /// Continue an interrupted experiment from its checkpoint.
    Resume(ResumeArgs),

    /// Summarize the checkpoint tree of an experiment.
    Status(StatusArgs),
}

/// Arguments for `tierbench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Experiment configuration (YAML).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Comma-separated tier ids to run (default: all).
    #[arg(short, long, value_delimiter = ',')]
    pub tiers: Vec<String>,

    /// Maximum concurrent units of work.
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Keep worktrees on disk after each run for debugging.
    #[arg(long)]
    pub preserve_workspaces: bool,

    /// Discard existing checkpoints and start over.
    #[arg(long)]
    pub fresh: bool,

    /// Print the experiment result as JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `tierbench resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Experiment configuration (YAML); must match the checkpoint.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Maximum concurrent units of work.
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Print the experiment result as JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `tierbench status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Checkpoint directory (`<results_dir>/<experiment_id>`).
    #[arg(short, long)]
    pub checkpoint_dir: PathBuf,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_experiment_command(args).await,
        Commands::Resume(args) => run_resume_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<ExperimentConfig> {
    ExperimentConfig::from_yaml_file(path).with_context(|| format!("failed to load config {}", path.display()))
}

async fn run_experiment_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)?;
    if !args.tiers.is_empty() {
        config = config.with_tiers_to_run(args.tiers);
    }
    if let Some(workers) = args.max_workers {
        config = config.with_max_workers(workers);
    }
    if args.preserve_workspaces {
        config = config.preserving_workspaces(true);
    }

    execute(config, args.fresh, args.json).await
}

async fn run_resume_command(args: ResumeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(workers) = args.max_workers {
        config = config.with_max_workers(workers);
    }

    let checkpoint_dir = config.checkpoint_dir();
    if CheckpointManager::at(&checkpoint_dir).manifest().await?.is_none() {
        anyhow::bail!("no checkpoint to resume at {}", checkpoint_dir.display());
    }

    execute(config, false, args.json).await
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let report = CheckpointManager::at(&args.checkpoint_dir)
        .status()
        .await
        .with_context(|| format!("failed to read checkpoint {}", args.checkpoint_dir.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}

async fn execute(config: ExperimentConfig, fresh: bool, json: bool) -> anyhow::Result<()> {
    let cancel = Shutdown::new();
    cancel_on_ctrl_c(cancel.clone());

    let orchestrator = TierOrchestrator::from_config(config, fresh, cancel).await?;
    let outcome = orchestrator.run().await;
    write_metrics(orchestrator.checkpoints().root()).await;

    let result = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.summary());
    }
    if result.is_partial() {
        warn!(failed = result.failed_tiers.len(), "Some tiers failed; results are partial");
    }
    Ok(())
}

/// Triggers `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: Shutdown) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight work");
            cancel.trigger();
        }
    });
}

async fn write_metrics(dir: &Path) {
    let path = dir.join(METRICS_FILE);
    match tokio::fs::write(&path, export_metrics()).await {
        Ok(()) => info!(path = %path.display(), "Metrics written"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "tierbench",
            "run",
            "--config",
            "exp.yaml",
            "--tiers",
            "T0,T1",
            "-w",
            "8",
            "--fresh",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("exp.yaml"));
                assert_eq!(args.tiers, vec!["T0", "T1"]);
                assert_eq!(args.max_workers, Some(8));
                assert!(args.fresh);
                assert!(!args.preserve_workspaces);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_status_with_global_log_level() {
        let cli = Cli::try_parse_from(["tierbench", "status", "--checkpoint-dir", "results/exp", "-l", "debug"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Status(ref a) if a.checkpoint_dir == Path::new("results/exp")));
    }

    #[test]
    fn test_resume_requires_config() {
        assert!(Cli::try_parse_from(["tierbench", "resume"]).is_err());
    }

    #[tokio::test]
    async fn test_status_without_checkpoint_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = run_status_command(StatusArgs {
            checkpoint_dir: dir.path().to_path_buf(),
            json: false,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to read checkpoint"));
    }
}
