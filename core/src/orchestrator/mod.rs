//! Experiment lifecycle management
//!
//! The [`ExperimentRunner`] drives a whole sweep:
//! - Enumerating units from the config and registering them in the checkpoint
//! - Skipping units that are already complete
//! - Probing for an active rate limit before the first dispatch
//! - Running each tier through a [`Scheduler`](crate::scheduler::Scheduler)
//! - Rebuilding `summary.json` from the run results on disk
//!
//! # Example
//!
//! ```ignore
//! use tierbench_core::{ExperimentConfig, ExperimentRunnerBuilder};
//!
//! let (runner, mut events) = ExperimentRunnerBuilder::new()
//!     .config(ExperimentConfig::from_path(path)?)
//!     .agent(agent)
//!     .judge(judge)
//!     .build()?;
//!
//! tokio::spawn(async move { while events.recv().await.is_some() {} });
//! let report = runner.run_with_signal_handling().await?;
//! ```

mod aggregator;
mod builder;
mod executor;

pub use aggregator::{ExperimentAggregate, RunRollup, TierAggregate};
pub use builder::ExperimentRunnerBuilder;
pub use executor::{
    plan, summarize, ExperimentReport, ExperimentRunner, ExperimentSummary, RunPlan, TierReport,
};
