//! CLI argument parsing and command dispatch

mod progress;
mod rerun;
mod run;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tierbench_backends::{CommandAgent, CommandJudge};
use tierbench_core::{AgentExecutor, ExperimentConfig, JudgeExecutor};

#[derive(Parser)]
#[command(name = "tierbench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run (or resume) an experiment
    Run(RunArgs),
    /// Inspect and repair an existing results tree
    #[command(subcommand)]
    Rerun(RerunCommand),
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: PathBuf,
    /// Override the per-tier worker count
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Show what would run without running it
    #[arg(long)]
    pub dry_run: bool,
    /// Discard the existing checkpoint and start over
    #[arg(long)]
    pub fresh: bool,
}

#[derive(Subcommand)]
pub enum RerunCommand {
    /// Classify every unit in a results tree
    Scan {
        /// Results directory
        #[arg(short, long)]
        results: PathBuf,
        /// Number of configured judge slots
        #[arg(long)]
        judges: usize,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Repair units in one state
    Repair(RepairArgs),
}

#[derive(Args)]
pub struct RepairArgs {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: PathBuf,
    /// Which units to repair
    #[arg(long, value_enum)]
    pub status: RepairStatus,
    /// List the units without touching them
    #[arg(long)]
    pub dry_run: bool,
    /// Override the worker count
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// Unit states `rerun repair` can act on
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RepairStatus {
    /// Never started: run the agent and judges
    #[value(name = "missing")]
    Missing,
    /// Agent crashed or was throttled: run the agent and judges again
    #[value(name = "failed")]
    Failed,
    /// Rebuild agent summaries and run results from files on disk
    #[value(name = "results-only")]
    ResultsOnly,
    /// Re-run missing judge slots, then rebuild run results
    #[value(name = "judges")]
    Judges,
    /// Re-run judge slots that hold a heuristic fallback, then rebuild run results
    #[value(name = "judge-fallback")]
    JudgeFallback,
}

pub async fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run(args) => run::execute(args).await,
        Commands::Rerun(RerunCommand::Scan {
            results,
            judges,
            json,
        }) => rerun::scan_tree(&results, judges, json),
        Commands::Rerun(RerunCommand::Repair(args)) => rerun::repair(args).await,
        Commands::Validate { config } => validate(&config),
    }
}

fn validate(path: &Path) -> Result<ExitCode> {
    let config = load_config(path, None)?;
    backends(&config)?;
    println!(
        "{}: experiment '{}', {} tiers, {} units, {} judges",
        path.display(),
        config.experiment_id,
        config.tiers.len(),
        config.total_units(),
        config.judges.len()
    );
    Ok(ExitCode::SUCCESS)
}

/// Load and validate a config, applying a concurrency override
pub(crate) fn load_config(path: &Path, concurrency: Option<usize>) -> Result<ExperimentConfig> {
    let mut config = ExperimentConfig::from_path(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    if let Some(n) = concurrency {
        config = config.with_concurrency(n);
    }
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

pub(crate) fn backends(
    config: &ExperimentConfig,
) -> Result<(Arc<dyn AgentExecutor>, Arc<dyn JudgeExecutor>)> {
    let agent = CommandAgent::new(&config.agent).context("Invalid agent command")?;
    let judge = CommandJudge::new(&config.judge).context("Invalid judge command")?;
    Ok((Arc::new(agent), Arc::new(judge)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repair_status() {
        let cli = Cli::try_parse_from([
            "tierbench",
            "rerun",
            "repair",
            "--config",
            "exp.yaml",
            "--status",
            "results-only",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Rerun(RerunCommand::Repair(args)) => {
                assert_eq!(args.status, RepairStatus::ResultsOnly);
                assert!(args.dry_run);
                assert_eq!(args.concurrency, None);
            }
            _ => panic!("expected rerun repair"),
        }
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "tierbench",
            "-v",
            "run",
            "-c",
            "exp.yaml",
            "--concurrency",
            "4",
            "--fresh",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.concurrency, Some(4));
                assert!(args.fresh);
                assert!(!args.dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_judge_fallback_status() {
        let cli = Cli::try_parse_from([
            "tierbench", "rerun", "repair", "-c", "x.yaml", "--status", "judge-fallback",
        ])
        .unwrap();
        match cli.command {
            Commands::Rerun(RerunCommand::Repair(args)) => {
                assert_eq!(args.status, RepairStatus::JudgeFallback)
            }
            _ => panic!("expected rerun repair"),
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(Cli::try_parse_from([
            "tierbench", "rerun", "repair", "-c", "x.yaml", "--status", "complete",
        ])
        .is_err());
    }
}
