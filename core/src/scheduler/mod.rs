//! Worker pool scheduler
//!
//! The scheduler drives a batch of units to terminal status:
//! - Building a fresh pool per pass (a `JoinSet` bounded by a `Semaphore`)
//! - Checkpointing each result before reporting it
//! - Tearing the pool down when the substrate breaks and rebuilding it
//! - Pausing the whole batch when a provider throttles
//! - Stopping dispatch on shutdown while in-flight units finish
//!
//! # Example
//!
//! ```ignore
//! use tierbench_core::scheduler::{BatchState, SchedulerBuilder};
//!
//! let scheduler = SchedulerBuilder::new()
//!     .worker(worker)
//!     .checkpoint(checkpoint)
//!     .concurrency(8)
//!     .build()?;
//!
//! let outcome = scheduler.run_batch(units).await?;
//! assert_eq!(outcome.state, BatchState::Completed);
//! ```

mod builder;
mod executor;
mod outcome;

pub use builder::SchedulerBuilder;
pub use executor::Scheduler;
pub use outcome::{BatchOutcome, BatchState};
