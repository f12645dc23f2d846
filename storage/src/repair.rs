//! Idempotent repairs that rebuild derived files from what is on disk
//!
//! Each repair works from a [`ScanReport`] taken beforehand and re-checks the
//! disk before writing, so running it twice changes nothing the second time.
//! Failures are collected per unit and never stop the other units.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;

use tierbench_core::layout::{read_json, read_json_opt, read_text_or_empty, write_json_atomic};
use tierbench_core::rate_limit::detect_rate_limit;
use tierbench_core::{
    AgentResult, ArtifactLayout, EvalError, EvalResult, JudgePanel, JudgeRequest, JudgeResult,
    RawAgentOutput, RunResult, TiePolicy, UnitDir, UnitKey,
};

use crate::classify::{fallback_judge_slots, missing_judge_slots, UnitState};
use crate::scan::ScanReport;

/// Outcome of one repair pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    /// Units whose files were rebuilt
    pub repaired: Vec<UnitKey>,
    /// Units that needed nothing by the time the repair reached them
    pub skipped: Vec<UnitKey>,
    /// Units that could not be repaired, with the reason
    pub errors: BTreeMap<UnitKey, String>,
}

impl RepairReport {
    /// Whether nothing failed
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether the pass wrote anything
    pub fn changed(&self) -> bool {
        !self.repaired.is_empty()
    }

    /// Combine two reports
    pub fn merge(mut self, other: Self) -> Self {
        self.repaired.extend(other.repaired);
        self.skipped.extend(other.skipped);
        self.errors.extend(other.errors);
        self
    }

    fn settle(&mut self, key: UnitKey, outcome: EvalResult<bool>) {
        match outcome {
            Ok(true) => self.repaired.push(key),
            Ok(false) => self.skipped.push(key),
            Err(e) => {
                tracing::warn!(unit = %key, error = %e, "Repair failed");
                self.errors.insert(key, e.to_string());
            }
        }
    }
}

// ============================================================================
// Agent summaries
// ============================================================================

/// Rebuild `agent/result.json` from `agent/output.json` and the captured logs
///
/// Never invokes the agent.
pub fn repair_agent_results(layout: &ArtifactLayout, scan: &ScanReport) -> RepairReport {
    let mut report = RepairReport::default();
    for key in scan.keys_in(UnitState::AgentSummaryMissing) {
        let outcome = rebuild_agent_result(&layout.unit_dir(&key));
        report.settle(key, outcome);
    }
    tracing::info!(
        repaired = report.repaired.len(),
        errors = report.errors.len(),
        "Agent summary repair finished"
    );
    report
}

fn rebuild_agent_result(unit_dir: &UnitDir) -> EvalResult<bool> {
    if unit_dir.agent_result().exists() {
        return Ok(false);
    }
    let raw: RawAgentOutput = read_json(&unit_dir.agent_output())?;

    let stderr = read_text_or_empty(&unit_dir.agent_stderr())?;
    let rate_limit_info = match detect_rate_limit(&stderr, "agent") {
        None if raw.exit_code != 0 => {
            detect_rate_limit(&read_text_or_empty(&unit_dir.agent_stdout())?, "agent")
        }
        found => found,
    };

    let agent = AgentResult::from_raw(
        &raw,
        unit_dir.relative(&unit_dir.agent_stdout()).to_path_buf(),
        unit_dir.relative(&unit_dir.agent_stderr()).to_path_buf(),
        rate_limit_info,
    );
    write_json_atomic(&unit_dir.agent_result(), &agent)?;
    Ok(true)
}

// ============================================================================
// Run results
// ============================================================================

/// Rebuild `run_result.json` for units whose agent and judge files all exist
///
/// Token totals come from the agent summary (`tokens_input` counts cache
/// reads) and consensus is folded again from the judge result files.
pub fn repair_run_results(
    layout: &ArtifactLayout,
    scan: &ScanReport,
    tie_policy: TiePolicy,
) -> RepairReport {
    let mut report = RepairReport::default();
    for key in scan.keys_in(UnitState::ResultsOnly) {
        let outcome = rebuild_run_result(&layout.unit_dir(&key), &key, scan.judge_count, tie_policy);
        report.settle(key, outcome);
    }
    tracing::info!(
        repaired = report.repaired.len(),
        errors = report.errors.len(),
        "Run result repair finished"
    );
    report
}

fn rebuild_run_result(
    unit_dir: &UnitDir,
    key: &UnitKey,
    judge_count: usize,
    tie_policy: TiePolicy,
) -> EvalResult<bool> {
    if read_json_opt::<RunResult>(&unit_dir.run_result())?.is_some() {
        return Ok(false);
    }
    write_run_result(unit_dir, key, judge_count, tie_policy)?;
    Ok(true)
}

fn write_run_result(
    unit_dir: &UnitDir,
    key: &UnitKey,
    judge_count: usize,
    tie_policy: TiePolicy,
) -> EvalResult<()> {
    let agent: AgentResult = read_json(&unit_dir.agent_result())?;
    let judges = (1..=judge_count as u32)
        .map(|n| read_json::<JudgeResult>(&unit_dir.judge_result(n)))
        .collect::<EvalResult<Vec<_>>>()?;

    let run = RunResult::assemble(key.clone(), agent, judges, tie_policy)
        .ok_or_else(|| EvalError::integrity(format!("{} has no judge results", key)))?;
    write_json_atomic(&unit_dir.run_result(), &run)?;
    tracing::debug!(
        unit = %key,
        tokens_input = run.tokens_input,
        consensus = ?run.consensus,
        "Rebuilt run result"
    );
    Ok(())
}

// ============================================================================
// Judge slots
// ============================================================================

/// Re-run only the missing or unreadable judge slots of judge-pending units
///
/// `models` are the configured judge models, slot `n` using `models[n - 1]`.
/// The judge context is rebuilt from `task_prompt.md` and the agent logs; a
/// deleted workspace is passed as `None`. Up to `concurrency` units are
/// repaired at once.
pub async fn repair_judge_slots(
    layout: &ArtifactLayout,
    scan: &ScanReport,
    panel: &JudgePanel,
    models: &[String],
    concurrency: usize,
) -> RepairReport {
    let keys = scan.keys_in(UnitState::JudgePending);
    let outcomes: Vec<(UnitKey, EvalResult<bool>)> = stream::iter(keys)
        .map(|key| async move {
            let outcome = rerun_missing_slots(&layout.unit_dir(&key), panel, models).await;
            (key, outcome)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = RepairReport::default();
    for (key, outcome) in outcomes {
        report.settle(key, outcome);
    }
    report.repaired.sort();
    report.skipped.sort();
    tracing::info!(
        repaired = report.repaired.len(),
        errors = report.errors.len(),
        "Judge slot repair finished"
    );
    report
}

/// Re-run the fallback judge slots listed in the scan, then rebuild each
/// unit's `run_result.json` from the new slots
///
/// Slots with a real verdict are left alone. A slot whose judge fails again
/// gets a fresh fallback.
pub async fn repair_fallback_slots(
    layout: &ArtifactLayout,
    scan: &ScanReport,
    panel: &JudgePanel,
    models: &[String],
    concurrency: usize,
) -> RepairReport {
    let outcomes: Vec<(UnitKey, EvalResult<bool>)> = stream::iter(scan.fallback_keys())
        .map(|key| async move {
            let unit_dir = layout.unit_dir(&key);
            let slots: Vec<u32> = fallback_judge_slots(&unit_dir, models.len()).collect();
            let outcome = match rerun_slots(&unit_dir, panel, models, slots).await {
                Ok(true) => write_run_result(&unit_dir, &key, models.len(), panel.tie_policy())
                    .map(|()| true),
                other => other,
            };
            (key, outcome)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = RepairReport::default();
    for (key, outcome) in outcomes {
        report.settle(key, outcome);
    }
    report.repaired.sort();
    report.skipped.sort();
    tracing::info!(
        repaired = report.repaired.len(),
        errors = report.errors.len(),
        "Fallback judge slot repair finished"
    );
    report
}

async fn rerun_missing_slots(
    unit_dir: &UnitDir,
    panel: &JudgePanel,
    models: &[String],
) -> EvalResult<bool> {
    let missing: Vec<u32> = missing_judge_slots(unit_dir, models.len()).collect();
    rerun_slots(unit_dir, panel, models, missing).await
}

async fn rerun_slots(
    unit_dir: &UnitDir,
    panel: &JudgePanel,
    models: &[String],
    slots: Vec<u32>,
) -> EvalResult<bool> {
    if slots.is_empty() {
        return Ok(false);
    }

    let agent: AgentResult = read_json(&unit_dir.agent_result())?;
    let task_prompt = read_text_or_empty(&unit_dir.task_prompt())?;
    if task_prompt.trim().is_empty() {
        return Err(EvalError::integrity(format!(
            "{} has no task prompt to judge against",
            unit_dir.path().display()
        )));
    }
    let workspace = unit_dir.workspace();
    let context = JudgeRequest {
        model: String::new(),
        judge_number: 0,
        task_prompt,
        agent_output: read_text_or_empty(&unit_dir.agent_stdout())?,
        agent_exit_code: agent.exit_code,
        workspace: workspace.is_dir().then_some(workspace),
    };

    for n in slots {
        let model = models
            .get(n as usize - 1)
            .cloned()
            .ok_or_else(|| EvalError::config(format!("no judge model for slot {}", n)))?;
        tracing::debug!(unit = %unit_dir.path().display(), judge = n, model = %model, "Re-running judge slot");
        panel
            .run_slot(
                unit_dir,
                JudgeRequest {
                    model,
                    judge_number: n,
                    ..context.clone()
                },
            )
            .await?;
    }
    Ok(true)
}
