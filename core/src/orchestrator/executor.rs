//! Experiment runner execution logic

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::channel::{Shutdown, UnitEvent};
use crate::checkpoint::{Checkpoint, CheckpointStore, StatusCounts, UnitStatus};
use crate::config::ExperimentConfig;
use crate::error::EvalResult;
use crate::layout::{read_json_opt, write_json_atomic, ArtifactLayout};
use crate::rate_limit::{preflight_check, RateLimitCoordinator, WaitOutcome, DEFAULT_RETRY_AFTER_SECS};
use crate::result::RunResult;
use crate::scheduler::{BatchOutcome, BatchState, SchedulerBuilder};
use crate::task::{enumerate_units, TaskUnit, UnitKey};
use crate::traits::AgentExecutor;
use crate::worker::SafeWorker;

use super::aggregator::ExperimentAggregate;

/// Contents of `summary.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    /// Experiment identifier
    pub experiment_id: String,
    /// When this summary was written
    pub generated_at: DateTime<Utc>,
    /// Units per checkpoint status
    pub status: StatusCounts,
    /// Rate-limit pauses so far
    pub pause_count: u32,
    /// Roll-ups of every run result on disk
    pub aggregate: ExperimentAggregate,
}

/// One tier's batch
#[derive(Debug, Clone)]
pub struct TierReport {
    /// Tier identifier
    pub tier_id: String,
    /// Batch outcome
    pub outcome: BatchOutcome,
    /// Why the tier stopped early, when its batch errored
    pub error: Option<String>,
}

impl TierReport {
    /// Fold a tier's batch result into a report
    ///
    /// An errored batch becomes a pool-broken outcome with every unit
    /// unresolved, so the other tiers and the summary are unaffected.
    pub(crate) fn from_result(tier_id: String, keys: Vec<UnitKey>, result: EvalResult<BatchOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                tier_id,
                outcome,
                error: None,
            },
            Err(e) => {
                tracing::error!(tier = %tier_id, error = %e, "Tier aborted");
                let mut outcome = BatchOutcome::new();
                outcome.state = BatchState::PoolBroken;
                outcome.unresolved = keys;
                Self {
                    tier_id,
                    outcome,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Result of one runner invocation
#[derive(Debug, Clone)]
pub struct ExperimentReport {
    /// Worst batch state across tiers
    pub state: BatchState,
    /// Units skipped because they were already complete
    pub skipped_complete: usize,
    /// Per-tier batches, in config order
    pub tiers: Vec<TierReport>,
    /// Summary as written to disk, absent when interrupted before any tier ran
    pub summary: Option<ExperimentSummary>,
}

impl ExperimentReport {
    fn interrupted(skipped_complete: usize) -> Self {
        Self {
            state: BatchState::Interrupted,
            skipped_complete,
            tiers: Vec::new(),
            summary: None,
        }
    }

    /// Units that ended failed in this invocation
    pub fn failed_units(&self) -> usize {
        self.tiers.iter().map(|t| t.outcome.failed.len()).sum()
    }

    /// Units completed in this invocation
    pub fn completed_units(&self) -> usize {
        self.tiers.iter().map(|t| t.outcome.completed.len()).sum()
    }
}

/// What a run would do, without doing it
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Units the config enumerates
    pub total_units: usize,
    /// Units the checkpoint already has complete
    pub already_complete: usize,
    /// Units that would be scheduled, in schedule order
    pub to_run: Vec<UnitKey>,
    /// Pause a resumed run would finish first
    pub pending_pause_until: Option<DateTime<Utc>>,
}

/// Compute the resume plan for a config without touching disk
pub fn plan(config: &ExperimentConfig) -> EvalResult<RunPlan> {
    let layout = ArtifactLayout::new(&config.results_dir);
    let checkpoint: Option<Checkpoint> = read_json_opt(&layout.checkpoint_path())?;
    let units = enumerate_units(config);

    let is_complete = |key: &UnitKey| {
        checkpoint
            .as_ref()
            .and_then(|c| c.status_of(key))
            .is_some_and(|s| s == UnitStatus::Complete)
    };
    let to_run: Vec<UnitKey> = units
        .iter()
        .filter(|u| !is_complete(&u.key))
        .map(|u| u.key.clone())
        .collect();

    Ok(RunPlan {
        total_units: units.len(),
        already_complete: units.len() - to_run.len(),
        to_run,
        pending_pause_until: checkpoint.and_then(|c| c.rate_limit_until),
    })
}

/// Experiment runner manages the experiment lifecycle
///
/// Responsible for enumerating units, skipping what is already complete,
/// pre-flight, running tiers, and writing the summary.
pub struct ExperimentRunner {
    pub(crate) config: ExperimentConfig,
    pub(crate) layout: ArtifactLayout,
    pub(crate) agent: Arc<dyn AgentExecutor>,
    pub(crate) worker: Arc<SafeWorker>,
    pub(crate) checkpoint: Arc<CheckpointStore>,
    pub(crate) coordinator: RateLimitCoordinator,
    pub(crate) events: mpsc::Sender<UnitEvent>,
    pub(crate) shutdown: Shutdown,
}

impl ExperimentRunner {
    /// Experiment configuration
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Artifact layout
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Shared checkpoint
    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    /// Shutdown signal observed by the runner
    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Run every unit that is not complete yet
    pub async fn run(&self) -> EvalResult<ExperimentReport> {
        self.run_selected(None).await
    }

    /// Run exactly the given units, whatever their checkpoint status
    ///
    /// Keys the config does not enumerate are ignored.
    pub async fn run_units(&self, keys: &[UnitKey]) -> EvalResult<ExperimentReport> {
        let selection: HashSet<UnitKey> = keys.iter().cloned().collect();
        self.run_selected(Some(&selection)).await
    }

    async fn run_selected(&self, selection: Option<&HashSet<UnitKey>>) -> EvalResult<ExperimentReport> {
        // 1. Finish a pause an earlier process was killed in
        if self
            .coordinator
            .resume_pending_wait(&self.checkpoint, &self.shutdown)
            .await?
            == WaitOutcome::Interrupted
        {
            return Ok(ExperimentReport::interrupted(0));
        }

        // 2. Enumerate and skip completed units
        let units = enumerate_units(&self.config);
        let keys: Vec<UnitKey> = units.iter().map(|u| u.key.clone()).collect();
        self.checkpoint.register_pending(&keys)?;

        let (todo, skipped_complete) = match selection {
            Some(selected) => {
                let todo: Vec<TaskUnit> = units
                    .into_iter()
                    .filter(|u| selected.contains(&u.key))
                    .collect();
                (todo, 0)
            }
            None => {
                let total = units.len();
                let todo: Vec<TaskUnit> = units
                    .into_iter()
                    .filter(|u| self.checkpoint.status_of(&u.key) != Some(UnitStatus::Complete))
                    .collect();
                let skipped = total - todo.len();
                (todo, skipped)
            }
        };

        tracing::info!(
            experiment = %self.config.experiment_id,
            to_run = todo.len(),
            skipped_complete,
            tiers = self.config.tiers.len(),
            "Starting experiment"
        );

        // 3. Pre-flight
        if self.config.preflight && !todo.is_empty() {
            if let Some(info) = preflight_check(self.agent.as_ref(), self.config.preflight_timeout()).await {
                tracing::warn!(
                    source = %info.source,
                    retry_after_secs = ?info.retry_after_seconds,
                    "Pre-flight detected an active rate limit"
                );
                let retry_after = info.retry_after_seconds.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                if self
                    .coordinator
                    .wait(retry_after, &self.checkpoint, &self.shutdown)
                    .await?
                    == WaitOutcome::Interrupted
                {
                    return Ok(ExperimentReport::interrupted(skipped_complete));
                }
            }
        }

        // 4. Tiers, in config order, `tier_parallelism` at a time
        let mut by_tier: BTreeMap<usize, (String, Vec<TaskUnit>)> = BTreeMap::new();
        for unit in todo {
            let position = self
                .config
                .tiers
                .iter()
                .position(|t| t.id == unit.key.tier_id)
                .unwrap_or(usize::MAX);
            by_tier
                .entry(position)
                .or_insert_with(|| (unit.key.tier_id.clone(), Vec::new()))
                .1
                .push(unit);
        }

        let parallelism = self.config.tier_parallelism.max(1);
        let tiers: Vec<TierReport> = stream::iter(by_tier.into_values())
            .map(|(tier_id, units)| async move {
                let keys: Vec<UnitKey> = units.iter().map(|u| u.key.clone()).collect();
                let outcome = self.run_tier(&tier_id, units).await;
                TierReport::from_result(tier_id, keys, outcome)
            })
            .buffered(parallelism)
            .collect()
            .await;

        // 5. Summary from whatever is on disk
        let summary = self.write_summary()?;
        let state = worst_state(tiers.iter().map(|t| t.outcome.state));

        tracing::info!(
            experiment = %self.config.experiment_id,
            state = %state,
            runs = summary.aggregate.totals.runs,
            passed = summary.aggregate.totals.passed,
            cost_usd = summary.aggregate.totals.cost_usd,
            "Experiment finished"
        );

        Ok(ExperimentReport {
            state,
            skipped_complete,
            tiers,
            summary: Some(summary),
        })
    }

    async fn run_tier(&self, tier_id: &str, units: Vec<TaskUnit>) -> EvalResult<BatchOutcome> {
        tracing::info!(tier = tier_id, units = units.len(), "Starting tier");
        let scheduler = SchedulerBuilder::new()
            .worker(Arc::clone(&self.worker))
            .checkpoint(Arc::clone(&self.checkpoint))
            .coordinator(self.coordinator.clone())
            .concurrency(self.config.concurrency)
            .max_retries(self.config.max_retries)
            .events(self.events.clone())
            .shutdown(self.shutdown.clone())
            .build()?;
        let outcome = scheduler.run_batch(units).await?;
        tracing::info!(
            tier = tier_id,
            state = %outcome.state,
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            "Tier finished"
        );
        Ok(outcome)
    }

    /// Rebuild `summary.json` from the run results on disk
    pub fn write_summary(&self) -> EvalResult<ExperimentSummary> {
        let summary = summarize(&self.config, &self.checkpoint.snapshot())?;
        write_json_atomic(&self.layout.summary_path(), &summary)?;
        Ok(summary)
    }

    /// Run with Ctrl+C signal handling
    ///
    /// Ctrl+C stops dispatch; in-flight units finish and are recorded.
    pub async fn run_with_signal_handling(&self) -> EvalResult<ExperimentReport> {
        let listener = self.shutdown.listen_for_ctrl_c();
        let result = self.run().await;
        listener.abort();
        result
    }
}

/// Build a summary from the run results under `config.results_dir`
///
/// Unreadable run results are skipped with a warning.
pub fn summarize(config: &ExperimentConfig, checkpoint: &Checkpoint) -> EvalResult<ExperimentSummary> {
    let layout = ArtifactLayout::new(&config.results_dir);
    let mut aggregate = ExperimentAggregate::default();
    for unit in enumerate_units(config) {
        let path = layout.unit_dir(&unit.key).run_result();
        match read_json_opt::<RunResult>(&path) {
            Ok(Some(run)) => aggregate.add_run(&run),
            Ok(None) => {}
            Err(e) => tracing::warn!(unit = %unit.key, error = %e, "Skipping unreadable run result"),
        }
    }
    Ok(ExperimentSummary {
        experiment_id: config.experiment_id.clone(),
        generated_at: Utc::now(),
        status: checkpoint.counts(),
        pause_count: checkpoint.pause_count,
        aggregate,
    })
}

pub(super) fn worst_state(states: impl Iterator<Item = BatchState>) -> BatchState {
    states.fold(BatchState::Completed, |worst, state| match (worst, state) {
        (BatchState::Interrupted, _) | (_, BatchState::Interrupted) => BatchState::Interrupted,
        (BatchState::PoolBroken, _) | (_, BatchState::PoolBroken) => BatchState::PoolBroken,
        _ => BatchState::Completed,
    })
}

impl std::fmt::Debug for ExperimentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRunner")
            .field("experiment_id", &self.config.experiment_id)
            .field("layout", &self.layout)
            .field("agent", &self.agent.name())
            .field("worker", &self.worker)
            .finish()
    }
}
