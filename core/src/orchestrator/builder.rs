//! Builder pattern for ExperimentRunner construction

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{ChannelConfig, Shutdown, UnitEvent};
use crate::checkpoint::CheckpointStore;
use crate::config::ExperimentConfig;
use crate::error::{EvalError, EvalResult};
use crate::layout::{ensure_dir, ArtifactLayout};
use crate::rate_limit::RateLimitCoordinator;
use crate::traits::{AgentExecutor, JudgeExecutor};
use crate::worker::{CallGate, WorkerBuilder};

use super::executor::ExperimentRunner;

/// Builder for creating an ExperimentRunner with proper configuration
///
/// # Example
///
/// ```ignore
/// let (runner, events) = ExperimentRunnerBuilder::new()
///     .config(ExperimentConfig::from_path(path)?)
///     .agent(agent)
///     .judge(judge)
///     .build()?;
///
/// let report = runner.run_with_signal_handling().await?;
/// ```
pub struct ExperimentRunnerBuilder {
    config: Option<ExperimentConfig>,
    agent: Option<Arc<dyn AgentExecutor>>,
    judge: Option<Arc<dyn JudgeExecutor>>,
    channel_config: ChannelConfig,
    shutdown: Shutdown,
    fresh: bool,
}

impl ExperimentRunnerBuilder {
    /// Create a new runner builder
    pub fn new() -> Self {
        Self {
            config: None,
            agent: None,
            judge: None,
            channel_config: ChannelConfig::default(),
            shutdown: Shutdown::new(),
            fresh: false,
        }
    }

    /// Set the experiment configuration
    pub fn config(mut self, config: ExperimentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the agent backend
    pub fn agent(mut self, agent: Arc<dyn AgentExecutor>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set the judge backend
    pub fn judge(mut self, judge: Arc<dyn JudgeExecutor>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Set the channel configuration
    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// Share a shutdown signal
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Discard any existing checkpoint instead of resuming it
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// Build the runner and return it along with the progress receiver
    ///
    /// Opens (or, with `fresh`, recreates) the checkpoint under the
    /// results directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend or the config is missing, the config
    /// is invalid, or the checkpoint belongs to another experiment.
    pub fn build(self) -> EvalResult<(ExperimentRunner, mpsc::Receiver<UnitEvent>)> {
        let config = self
            .config
            .ok_or_else(|| EvalError::missing_config("config"))?;
        let agent = self
            .agent
            .ok_or_else(|| EvalError::missing_config("agent"))?;
        let judge = self
            .judge
            .ok_or_else(|| EvalError::missing_config("judge"))?;
        config.validate()?;

        let layout = ArtifactLayout::new(&config.results_dir);
        ensure_dir(layout.root())?;
        let checkpoint_path = layout.checkpoint_path();
        let checkpoint = if self.fresh {
            tracing::info!(path = %checkpoint_path.display(), "Starting from a fresh checkpoint");
            CheckpointStore::create(checkpoint_path, &config.experiment_id)?
        } else {
            CheckpointStore::open_or_create(checkpoint_path, &config.experiment_id)?
        };

        let gate = CallGate::new(config.calls_per_second, config.global_call_limit);
        let worker = WorkerBuilder::new()
            .agent(Arc::clone(&agent))
            .judge(judge)
            .layout(layout.clone())
            .gate(gate)
            .tie_policy(config.tie_policy)
            .build()?;

        let (events, events_rx) = self.channel_config.event_channel();
        let runner = ExperimentRunner {
            coordinator: RateLimitCoordinator::new(config.max_backoff()),
            config,
            layout,
            agent,
            worker: Arc::new(worker),
            checkpoint: Arc::new(checkpoint),
            events,
            shutdown: self.shutdown,
        };
        Ok((runner, events_rx))
    }
}

impl Default for ExperimentRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
