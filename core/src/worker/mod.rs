//! Safe worker wrapper for executing task units
//!
//! A worker runs one unit through its whole lifecycle:
//!
//! 1. Writes the task prompt and creates the workspace
//! 2. Executes the agent via an `AgentExecutor`
//! 3. Persists raw logs, `agent/output.json`, and the derived summary
//! 4. Runs every judge slot through the `JudgePanel`
//! 5. Consolidates and persists `run_result.json`
//!
//! Whatever happens inside, including a panic, `SafeWorker::run` returns a
//! classified [`UnitOutcome`]. The scheduler decides what the outcome means
//! for the rest of the batch.
//!
//! # Example
//!
//! ```ignore
//! use tierbench_core::worker::{UnitOutcome, WorkerBuilder};
//!
//! let worker = WorkerBuilder::new()
//!     .agent(agent)
//!     .judge(judge)
//!     .layout(layout)
//!     .build()?;
//!
//! let result = worker.run(&unit).await;
//! if let UnitOutcome::Success(run) = result.outcome {
//!     println!("score: {:?}", run.consensus.score());
//! }
//! ```

mod builder;
mod call_gate;
mod executor;
mod outcome;
mod stats;

pub use builder::WorkerBuilder;
pub use call_gate::{CallGate, CallPacer, CallPermit};
pub use executor::SafeWorker;
pub use outcome::{UnitOutcome, WorkerResult};
pub use stats::WorkerStats;

#[cfg(test)]
pub(crate) mod tests;
