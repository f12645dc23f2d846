//! Subprocess backends for tierbench
//!
//! This crate provides implementations of the core backend traits that
//! shell out to external commands:
//!
//! - [`CommandAgent`]: runs the agent architecture under test for one unit
//! - [`CommandJudge`]: scores one agent result for one judge slot

#![warn(missing_docs)]
#![warn(clippy::all)]

mod agent;
mod command;
mod judge;

pub use agent::{CommandAgent, DEFAULT_AGENT_TIMEOUT};
pub use command::{run_command, BackendConfigError, CommandError, CommandOutput, CommandSpec};
pub use judge::{render_prompt, CommandJudge, DEFAULT_JUDGE_TIMEOUT};
