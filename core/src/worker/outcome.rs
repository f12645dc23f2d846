//! Classified result of running one unit

use crate::result::{RateLimitInfo, RunResult};
use crate::task::UnitKey;

/// What happened to a unit; the wrapper never reports anything else
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// Agent and every judge slot finished; artifacts are on disk
    Success(Box<RunResult>),
    /// This unit failed on its own; siblings are unaffected
    WorkerFailure {
        /// Failure reason
        error: String,
    },
    /// The execution substrate broke; the pool must be rebuilt
    PoolFailure {
        /// Failure reason
        error: String,
    },
    /// The provider throttled this unit
    RateLimited(RateLimitInfo),
}

impl UnitOutcome {
    /// Whether the unit completed
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Success(_))
    }

    /// Failure reason, if any
    pub fn error(&self) -> Option<String> {
        match self {
            UnitOutcome::Success(_) => None,
            UnitOutcome::WorkerFailure { error } | UnitOutcome::PoolFailure { error } => {
                Some(error.clone())
            }
            UnitOutcome::RateLimited(info) => Some(info.to_string()),
        }
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Success(_) => "success",
            UnitOutcome::WorkerFailure { .. } => "worker_failure",
            UnitOutcome::PoolFailure { .. } => "pool_failure",
            UnitOutcome::RateLimited(_) => "rate_limited",
        }
    }
}

/// Outcome tagged with the unit it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    /// Unit identity
    pub key: UnitKey,
    /// Classified outcome
    pub outcome: UnitOutcome,
}
