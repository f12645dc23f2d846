//! `tierbench run`

use std::process::ExitCode;

use anyhow::Result;
use tierbench_core::{plan, BatchState, ExperimentReport, ExperimentRunnerBuilder};

use super::progress::Progress;
use super::{backends, load_config, RunArgs};

pub async fn execute(args: RunArgs) -> Result<ExitCode> {
    let config = load_config(&args.config, args.concurrency)?;
    let plan = plan(&config)?;
    let scheduled = if args.fresh {
        plan.total_units
    } else {
        plan.to_run.len()
    };

    if args.dry_run {
        println!("experiment: {}", config.experiment_id);
        println!("results:    {}", config.results_dir.display());
        println!("units:      {}", plan.total_units);
        if args.fresh {
            println!("checkpoint: discarded (--fresh), every unit runs");
        } else {
            println!("complete:   {}", plan.already_complete);
            println!("to run:     {}", plan.to_run.len());
            for key in &plan.to_run {
                println!("  {}", key);
            }
            if let Some(until) = plan.pending_pause_until {
                println!("pending rate-limit pause until {}", until.to_rfc3339());
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let (agent, judge) = backends(&config)?;
    let (runner, events) = ExperimentRunnerBuilder::new()
        .config(config)
        .agent(agent)
        .judge(judge)
        .fresh(args.fresh)
        .build()?;

    let progress = Progress::spawn(scheduled, events);
    let report = runner.run_with_signal_handling().await;
    // The runner holds the last event sender
    drop(runner);
    progress.finish().await;

    let report = report?;
    print_report(&report);
    Ok(exit_code(&report))
}

fn print_report(report: &ExperimentReport) {
    for tier in &report.tiers {
        println!(
            "{}: {} ({} complete, {} failed, {} passes, {} pauses)",
            tier.tier_id,
            tier.outcome.state,
            tier.outcome.completed.len(),
            tier.outcome.failed.len(),
            tier.outcome.passes,
            tier.outcome.pauses
        );
        if let Some(error) = &tier.error {
            println!("  aborted: {}", error);
        }
    }
    if report.skipped_complete > 0 {
        println!("skipped {} already complete units", report.skipped_complete);
    }
    if let Some(summary) = &report.summary {
        let overall = &summary.aggregate.totals;
        println!(
            "overall: {} runs, pass rate {}, mean score {}, cost ${:.2}",
            overall.runs,
            fmt_ratio(overall.pass_rate()),
            fmt_ratio(overall.mean_score()),
            overall.cost_usd
        );
    }
}

fn fmt_ratio(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.3}", v))
}

/// 130 on interrupt, 1 if any unit failed or the pool broke, else 0
pub(crate) fn exit_code(report: &ExperimentReport) -> ExitCode {
    match report.state {
        BatchState::Interrupted => {
            eprintln!("Interrupted. Re-run the same command to resume.");
            ExitCode::from(130)
        }
        BatchState::PoolBroken => ExitCode::FAILURE,
        BatchState::Completed if report.failed_units() > 0 => ExitCode::FAILURE,
        BatchState::Completed => ExitCode::SUCCESS,
    }
}
