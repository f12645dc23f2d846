//! Scheduler execution logic

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::channel::{Shutdown, UnitEvent};
use crate::checkpoint::{CheckpointStore, RecordExtra, UnitStatus};
use crate::error::EvalResult;
use crate::layout::UnitDir;
use crate::rate_limit::{detect_post_hoc, RateLimitCoordinator, WaitOutcome, DEFAULT_RETRY_AFTER_SECS};
use crate::result::RateLimitInfo;
use crate::task::{TaskUnit, UnitKey};
use crate::worker::{SafeWorker, UnitOutcome, WorkerResult};

use super::outcome::{BatchOutcome, BatchState};

/// What a pool task hands back to the collector
enum TaskReport {
    /// Never got a permit: dispatch stopped or shutdown
    Skipped,
    /// Ran through the worker
    Ran(WorkerResult),
}

/// What the collector should do after settling one result
#[derive(Debug, PartialEq, Eq)]
enum Settled {
    Continue,
    StopDispatch,
    PoolBroken,
}

/// Bookkeeping for one pass
#[derive(Default)]
struct PassReport {
    resolved: HashSet<UnitKey>,
    rate_limits: Vec<RateLimitInfo>,
    failure_reasons: Vec<String>,
    failed_dirs: Vec<UnitDir>,
    broken: bool,
}

/// Runs batches of units over a bounded, rebuildable worker pool
///
/// Use `SchedulerBuilder` for construction.
pub struct Scheduler {
    pub(crate) worker: Arc<SafeWorker>,
    pub(crate) checkpoint: Arc<CheckpointStore>,
    pub(crate) coordinator: RateLimitCoordinator,
    pub(crate) concurrency: usize,
    pub(crate) max_retries: u32,
    pub(crate) events: Option<mpsc::Sender<UnitEvent>>,
    pub(crate) shutdown: Shutdown,
}

impl Scheduler {
    /// Shutdown signal observed by this scheduler
    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Run every unit to a terminal status, or until interrupted
    ///
    /// Each pass builds a fresh pool for the units still unresolved. A pass
    /// that ends with unresolved units (pool broken, throttled) counts as
    /// one rebuild; after `max_retries` rebuilds the leftovers are failed.
    pub async fn run_batch(&self, units: Vec<TaskUnit>) -> EvalResult<BatchOutcome> {
        let mut batch = BatchOutcome::new();
        batch.stats.start();
        let mut pending: Vec<Arc<TaskUnit>> = units.into_iter().map(Arc::new).collect();
        let mut rebuilds = 0u32;

        tracing::info!(
            units = pending.len(),
            concurrency = self.concurrency,
            max_retries = self.max_retries,
            "Starting batch"
        );

        batch.state = loop {
            if pending.is_empty() {
                break BatchState::Completed;
            }
            if self.shutdown.is_triggered() {
                break BatchState::Interrupted;
            }

            batch.passes += 1;
            let pass = if self.concurrency < 2 || pending.len() == 1 {
                self.run_inline(&pending, &mut batch).await?
            } else {
                self.run_pool(&pending, &mut batch).await?
            };
            pending.retain(|unit| !pass.resolved.contains(&unit.key));
            self.release_in_progress(&pending).await?;

            if pending.is_empty() {
                break BatchState::Completed;
            }
            if self.shutdown.is_triggered() {
                break BatchState::Interrupted;
            }

            let limit = if pass.rate_limits.is_empty() && !pass.broken {
                None
            } else {
                detect_post_hoc(&pass.rate_limits, &pass.failure_reasons, &pass.failed_dirs)
            };
            if let Some(info) = &limit {
                batch.last_rate_limit = Some(info.clone());
            }

            if rebuilds >= self.max_retries {
                tracing::error!(
                    remaining = pending.len(),
                    rebuilds,
                    "Retry bound exhausted, marking remaining units failed"
                );
                let reason = limit
                    .map(|info| info.to_string())
                    .or_else(|| pass.failure_reasons.last().cloned())
                    .unwrap_or_else(|| "pool broken".to_string());
                for unit in &pending {
                    let error = format!("retries exhausted after {} rebuilds: {}", rebuilds, reason);
                    self.checkpoint
                        .record_async(&unit.key, UnitStatus::Failed, RecordExtra::error(error.clone()))
                        .await?;
                    self.emit(&unit.key, UnitStatus::Failed, Some(error.clone())).await;
                    batch.failed.insert(unit.key.clone(), error);
                }
                pending.clear();
                break BatchState::PoolBroken;
            }
            rebuilds += 1;

            if let Some(info) = limit {
                let retry_after = info.retry_after_seconds.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                batch.pauses += 1;
                let waited = self
                    .coordinator
                    .wait(retry_after, &self.checkpoint, &self.shutdown)
                    .await?;
                if waited == WaitOutcome::Interrupted {
                    break BatchState::Interrupted;
                }
            }

            tracing::warn!(
                remaining = pending.len(),
                rebuild = rebuilds,
                max_retries = self.max_retries,
                "Rebuilding worker pool"
            );
        };

        batch.unresolved = pending.iter().map(|unit| unit.key.clone()).collect();
        batch.stats.stop();

        tracing::info!(
            state = %batch.state,
            completed = batch.completed.len(),
            failed = batch.failed.len(),
            unresolved = batch.unresolved.len(),
            passes = batch.passes,
            pauses = batch.pauses,
            "Batch finished"
        );
        Ok(batch)
    }

    /// Run units one at a time with no pool
    async fn run_inline(
        &self,
        units: &[Arc<TaskUnit>],
        batch: &mut BatchOutcome,
    ) -> EvalResult<PassReport> {
        let mut pass = PassReport::default();
        for unit in units {
            if self.shutdown.is_triggered() {
                break;
            }
            self.checkpoint
                .record_async(&unit.key, UnitStatus::InProgress, RecordExtra::none())
                .await?;
            let result = self.worker.run(unit).await;
            if self.settle(result, &mut pass, batch).await? != Settled::Continue {
                break;
            }
        }
        Ok(pass)
    }

    /// Run units on a fresh pool and collect results in completion order
    async fn run_pool(
        &self,
        units: &[Arc<TaskUnit>],
        batch: &mut BatchOutcome,
    ) -> EvalResult<PassReport> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let stop = Shutdown::new();
        let mut set = JoinSet::new();

        tracing::debug!(units = units.len(), pass = batch.passes, "Building worker pool");

        for unit in units {
            let unit = Arc::clone(unit);
            let worker = Arc::clone(&self.worker);
            let checkpoint = Arc::clone(&self.checkpoint);
            let semaphore = Arc::clone(&semaphore);
            let stop = stop.clone();
            let shutdown = self.shutdown.clone();

            set.spawn(async move {
                let _permit = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => return TaskReport::Skipped,
                    _ = stop.cancelled() => return TaskReport::Skipped,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return TaskReport::Skipped,
                    },
                };
                if let Err(e) = checkpoint
                    .record_async(&unit.key, UnitStatus::InProgress, RecordExtra::none())
                    .await
                {
                    tracing::warn!(unit = %unit.key, error = %e, "Failed to mark unit in progress");
                }
                TaskReport::Ran(worker.run(&unit).await)
            });
        }

        let mut pass = PassReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(TaskReport::Skipped) => {}
                Ok(TaskReport::Ran(result)) => match self.settle(result, &mut pass, batch).await {
                    Ok(Settled::Continue) => {}
                    Ok(Settled::StopDispatch) => stop.trigger(),
                    Ok(Settled::PoolBroken) => {
                        stop.trigger();
                        set.abort_all();
                    }
                    Err(e) => {
                        set.abort_all();
                        return Err(e);
                    }
                },
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Pool task failed outside the worker wrapper");
                    pass.broken = true;
                    pass.failure_reasons.push(e.to_string());
                    stop.trigger();
                    set.abort_all();
                }
            }
        }
        Ok(pass)
    }

    /// Checkpoint one result, then record it in the batch and emit it
    async fn settle(
        &self,
        result: WorkerResult,
        pass: &mut PassReport,
        batch: &mut BatchOutcome,
    ) -> EvalResult<Settled> {
        let key = result.key;
        batch.stats.record(&result.outcome);

        let (status, settled) = match result.outcome {
            UnitOutcome::Success(run) => {
                let extra = RecordExtra::none()
                    .with("score", json!(run.consensus.score()))
                    .with("passed", json!(run.consensus.passed()))
                    .with("cost_usd", run.cost_usd);
                self.checkpoint
                    .record_async(&key, UnitStatus::Complete, extra)
                    .await?;
                pass.resolved.insert(key.clone());
                batch.failed.remove(&key);
                batch.completed.insert(key.clone(), *run);
                (UnitStatus::Complete, Settled::Continue)
            }
            UnitOutcome::WorkerFailure { error } => {
                self.checkpoint
                    .record_async(&key, UnitStatus::Failed, RecordExtra::error(error.clone()))
                    .await?;
                pass.resolved.insert(key.clone());
                pass.failure_reasons.push(error.clone());
                pass.failed_dirs.push(self.worker.layout().unit_dir(&key));
                batch.failed.insert(key.clone(), error.clone());
                self.emit(&key, UnitStatus::Failed, Some(error)).await;
                return Ok(Settled::Continue);
            }
            UnitOutcome::RateLimited(info) => {
                let error = info.to_string();
                self.checkpoint
                    .record_async(&key, UnitStatus::RateLimited, RecordExtra::error(error.clone()))
                    .await?;
                pass.rate_limits.push(info);
                self.emit(&key, UnitStatus::RateLimited, Some(error)).await;
                return Ok(Settled::StopDispatch);
            }
            UnitOutcome::PoolFailure { error } => {
                self.checkpoint
                    .record_async(&key, UnitStatus::Pending, RecordExtra::error(error.clone()))
                    .await?;
                pass.broken = true;
                pass.failure_reasons.push(error.clone());
                pass.failed_dirs.push(self.worker.layout().unit_dir(&key));
                self.emit(&key, UnitStatus::Pending, Some(error)).await;
                return Ok(Settled::PoolBroken);
            }
        };

        self.emit(&key, status, None).await;
        Ok(settled)
    }

    /// Units left in progress by an aborted or skipped task go back to pending
    async fn release_in_progress(&self, units: &[Arc<TaskUnit>]) -> EvalResult<()> {
        for unit in units {
            if self.checkpoint.status_of(&unit.key) == Some(UnitStatus::InProgress) {
                self.checkpoint
                    .record_async(&unit.key, UnitStatus::Pending, RecordExtra::none())
                    .await?;
            }
        }
        Ok(())
    }

    async fn emit(&self, key: &UnitKey, status: UnitStatus, error: Option<String>) {
        if let Some(tx) = &self.events {
            let event = UnitEvent {
                key: key.clone(),
                status,
                error,
            };
            if tx.send(event).await.is_err() {
                tracing::debug!("Progress channel closed");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker", &self.worker)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
