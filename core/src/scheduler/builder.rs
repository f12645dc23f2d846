//! Builder pattern for Scheduler construction

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{Shutdown, UnitEvent};
use crate::checkpoint::CheckpointStore;
use crate::error::{EvalError, EvalResult};
use crate::rate_limit::RateLimitCoordinator;
use crate::worker::SafeWorker;

use super::executor::Scheduler;

/// Builder for creating a Scheduler
///
/// # Example
///
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .worker(Arc::new(worker))
///     .checkpoint(Arc::clone(&checkpoint))
///     .concurrency(8)
///     .max_retries(3)
///     .shutdown(shutdown.clone())
///     .build()?;
///
/// let outcome = scheduler.run_batch(units).await?;
/// ```
pub struct SchedulerBuilder {
    worker: Option<Arc<SafeWorker>>,
    checkpoint: Option<Arc<CheckpointStore>>,
    coordinator: RateLimitCoordinator,
    concurrency: usize,
    max_retries: u32,
    events: Option<mpsc::Sender<UnitEvent>>,
    shutdown: Option<Shutdown>,
}

impl SchedulerBuilder {
    /// Create a builder with concurrency 1 and three retries
    pub fn new() -> Self {
        Self {
            worker: None,
            checkpoint: None,
            coordinator: RateLimitCoordinator::default(),
            concurrency: 1,
            max_retries: 3,
            events: None,
            shutdown: None,
        }
    }

    /// Set the worker
    pub fn worker(mut self, worker: Arc<SafeWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Set the checkpoint store
    pub fn checkpoint(mut self, checkpoint: Arc<CheckpointStore>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Set the rate-limit coordinator
    pub fn coordinator(mut self, coordinator: RateLimitCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Set the pool size
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the rebuild bound per batch
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Emit progress events on this channel
    pub fn events(mut self, events: mpsc::Sender<UnitEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a shutdown signal
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the scheduler
    ///
    /// # Errors
    ///
    /// Returns an error if the worker or checkpoint is missing, or the
    /// concurrency is zero.
    pub fn build(self) -> EvalResult<Scheduler> {
        let worker = self
            .worker
            .ok_or_else(|| EvalError::missing_config("worker"))?;
        let checkpoint = self
            .checkpoint
            .ok_or_else(|| EvalError::missing_config("checkpoint"))?;
        if self.concurrency == 0 {
            return Err(EvalError::config("concurrency must be at least 1"));
        }

        Ok(Scheduler {
            worker,
            checkpoint,
            coordinator: self.coordinator,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            events: self.events,
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
