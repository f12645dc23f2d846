//! `tierbench rerun scan` and `tierbench rerun repair`

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tierbench_backends::CommandJudge;
use tierbench_core::layout::write_json_atomic;
use tierbench_core::{
    enumerate_units, summarize, ArtifactLayout, CallGate, CheckpointStore, ExperimentConfig,
    ExperimentRunnerBuilder, JudgePanel, RecordExtra, UnitKey, UnitStatus,
};
use tierbench_storage::{
    repair_agent_results, repair_fallback_slots, repair_judge_slots, repair_run_results, scan,
    RepairReport, ScanReport, UnitState,
};

use super::progress::Progress;
use super::run::exit_code;
use super::{backends, load_config, RepairArgs, RepairStatus};

pub fn scan_tree(results: &Path, judges: usize, json: bool) -> Result<ExitCode> {
    let layout = ArtifactLayout::new(results);
    let report = scan(&layout, judges, &[])
        .with_context(|| format!("Failed to scan {}", results.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    print_counts(&report);
    for (key, state) in &report.units {
        if *state != UnitState::Complete {
            println!("  {:<24} {}", state.to_string(), key);
        }
    }
    for (key, slots) in &report.fallback_slots {
        println!("  {:<24} {} (slots {:?})", "judge_fallback", key, slots);
    }
    for path in &report.ignored {
        println!("  ignored {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn repair(args: RepairArgs) -> Result<ExitCode> {
    let config = load_config(&args.config, args.concurrency)?;
    let layout = ArtifactLayout::new(&config.results_dir);
    let expected: Vec<UnitKey> = enumerate_units(&config).into_iter().map(|u| u.key).collect();
    let judge_count = config.judges.len();
    let before = scan(&layout, judge_count, &expected)?;

    let targets = targets(&before, args.status);
    println!("{} units to repair ({:?})", targets.len(), args.status);
    if args.dry_run {
        for key in &targets {
            println!("  {} ({})", key, before.units[key]);
        }
        return Ok(ExitCode::SUCCESS);
    }
    if targets.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    match args.status {
        RepairStatus::Missing | RepairStatus::Failed => rerun_agents(config, &targets).await,
        RepairStatus::ResultsOnly => {
            let report = repair_agent_results(&layout, &before);
            let rescan = scan(&layout, judge_count, &expected)?;
            let report = report.merge(repair_run_results(&layout, &rescan, config.tie_policy));
            finish_repair(&config, &layout, &expected, report)
        }
        RepairStatus::Judges | RepairStatus::JudgeFallback => {
            let judge = CommandJudge::new(&config.judge).context("Invalid judge command")?;
            let panel = JudgePanel::new(Arc::new(judge))
                .with_gate(CallGate::new(
                    config.calls_per_second,
                    config.global_call_limit,
                ))
                .with_tie_policy(config.tie_policy);

            let slots = async {
                if args.status == RepairStatus::JudgeFallback {
                    repair_fallback_slots(&layout, &before, &panel, &config.judges, config.concurrency).await
                } else {
                    repair_judge_slots(&layout, &before, &panel, &config.judges, config.concurrency).await
                }
            };
            let report = tokio::select! {
                report = slots => report,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("Interrupted. Finished judge slots are kept; re-run to continue.");
                    return Ok(ExitCode::from(130));
                }
            };
            let rescan = scan(&layout, judge_count, &expected)?;
            let report = report.merge(repair_run_results(&layout, &rescan, config.tie_policy));
            finish_repair(&config, &layout, &expected, report)
        }
    }
}

fn targets(scan: &ScanReport, status: RepairStatus) -> Vec<UnitKey> {
    let states: &[UnitState] = match status {
        RepairStatus::Missing => &[UnitState::Missing],
        RepairStatus::Failed => &[UnitState::Failed],
        RepairStatus::ResultsOnly => &[UnitState::AgentSummaryMissing, UnitState::ResultsOnly],
        RepairStatus::Judges => &[UnitState::JudgePending],
        RepairStatus::JudgeFallback => return scan.fallback_keys(),
    };
    let mut keys: Vec<UnitKey> = states.iter().flat_map(|s| scan.keys_in(*s)).collect();
    keys.sort();
    keys
}

async fn rerun_agents(config: ExperimentConfig, targets: &[UnitKey]) -> Result<ExitCode> {
    let (agent, judge) = backends(&config)?;
    let (runner, events) = ExperimentRunnerBuilder::new()
        .config(config)
        .agent(agent)
        .judge(judge)
        .build()?;

    let progress = Progress::spawn(targets.len(), events);
    let listener = runner.shutdown_signal().listen_for_ctrl_c();
    let report = runner.run_units(targets).await;
    listener.abort();
    drop(runner);
    progress.finish().await;

    let report = report?;
    println!(
        "{} units completed, {} failed",
        report.completed_units(),
        report.failed_units()
    );
    Ok(exit_code(&report))
}

/// Record repaired units as complete and rewrite the summary
fn finish_repair(
    config: &ExperimentConfig,
    layout: &ArtifactLayout,
    expected: &[UnitKey],
    report: RepairReport,
) -> Result<ExitCode> {
    let after = scan(layout, config.judges.len(), expected)?;
    let known: HashSet<&UnitKey> = expected.iter().collect();
    let checkpoint = CheckpointStore::open_or_create(layout.checkpoint_path(), &config.experiment_id)?;

    let mut recorded = 0;
    for key in after.keys_in(UnitState::Complete) {
        if known.contains(&key) && checkpoint.status_of(&key) != Some(UnitStatus::Complete) {
            checkpoint.record(&key, UnitStatus::Complete, RecordExtra::none())?;
            recorded += 1;
        }
    }
    let summary = summarize(config, &checkpoint.snapshot())?;
    write_json_atomic(&layout.summary_path(), &summary)?;

    println!(
        "repaired {}, skipped {}, errors {}, {} units newly complete",
        report.repaired.len(),
        report.skipped.len(),
        report.errors.len(),
        recorded
    );
    for (key, error) in &report.errors {
        println!("  {}: {}", key, error);
    }
    print_counts(&after);
    if !after.fallback_slots.is_empty() {
        println!("{:<24} {}", "judge_fallback", after.fallback_slots.len());
    }

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_counts(report: &ScanReport) {
    for (state, count) in report.counts() {
        println!("{:<24} {}", state.to_string(), count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_results_only_targets_both_rebuildable_states() {
        let mut units = BTreeMap::new();
        units.insert(UnitKey::new("T0", "s01", 2), UnitState::ResultsOnly);
        units.insert(UnitKey::new("T0", "s01", 1), UnitState::AgentSummaryMissing);
        units.insert(UnitKey::new("T1", "s01", 1), UnitState::JudgePending);
        units.insert(UnitKey::new("T1", "s02", 1), UnitState::Failed);
        let mut fallback_slots = BTreeMap::new();
        fallback_slots.insert(UnitKey::new("T2", "s01", 1), vec![2]);
        let scan = ScanReport {
            judge_count: 3,
            units,
            fallback_slots,
            ignored: Vec::new(),
        };

        assert_eq!(
            targets(&scan, RepairStatus::ResultsOnly),
            vec![UnitKey::new("T0", "s01", 1), UnitKey::new("T0", "s01", 2)]
        );
        assert_eq!(
            targets(&scan, RepairStatus::Judges),
            vec![UnitKey::new("T1", "s01", 1)]
        );
        assert!(targets(&scan, RepairStatus::Missing).is_empty());
        assert_eq!(
            targets(&scan, RepairStatus::JudgeFallback),
            vec![UnitKey::new("T2", "s01", 1)]
        );
    }
}
