//! tierbench-core: Engine for tiered agent evaluations
//!
//! This crate runs a sweep of (tier, subtest, run) units through an agent
//! backend and a panel of judges, including:
//!
//! - Unit enumeration and the on-disk artifact layout
//! - A panic-isolating worker and a rebuildable worker pool
//! - Rate-limit detection and checkpointed backoff
//! - A crash-safe checkpoint for resuming interrupted sweeps
//! - Judge consensus and experiment roll-ups
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod error;
pub mod layout;
pub mod orchestrator;
pub mod rate_limit;
pub mod result;
pub mod scheduler;
pub mod task;
pub mod traits;
pub mod worker;

pub use channel::{ChannelConfig, Shutdown, UnitEvent};
pub use checkpoint::*;
pub use config::*;
pub use consensus::*;
pub use error::*;
pub use layout::{ArtifactLayout, UnitDir};
pub use orchestrator::{
    plan, summarize, ExperimentAggregate, ExperimentReport, ExperimentRunner,
    ExperimentRunnerBuilder, ExperimentSummary, RunPlan, RunRollup, TierAggregate, TierReport,
};
pub use rate_limit::{RateLimitCoordinator, WaitOutcome};
pub use result::*;
pub use scheduler::{BatchOutcome, BatchState, Scheduler, SchedulerBuilder};
pub use task::*;
pub use traits::*;
pub use worker::{CallGate, SafeWorker, UnitOutcome, WorkerBuilder, WorkerResult, WorkerStats};
