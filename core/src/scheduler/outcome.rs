//! Batch-level outcome

use std::collections::BTreeMap;

use crate::result::{RateLimitInfo, RunResult};
use crate::task::UnitKey;
use crate::worker::WorkerStats;

/// Terminal state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Every unit reached complete or failed
    Completed,
    /// Shutdown stopped the batch; unresolved units stay non-terminal
    Interrupted,
    /// The retry bound was exhausted; leftover units were marked failed
    PoolBroken,
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchState::Completed => "completed",
            BatchState::Interrupted => "interrupted",
            BatchState::PoolBroken => "pool_broken",
        };
        f.write_str(name)
    }
}

/// Everything a batch produced
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// How the batch ended
    pub state: BatchState,
    /// Completed units
    pub completed: BTreeMap<UnitKey, RunResult>,
    /// Failed units and their last failure reason
    pub failed: BTreeMap<UnitKey, String>,
    /// Units left non-terminal by an interrupt
    pub unresolved: Vec<UnitKey>,
    /// Pool passes run
    pub passes: u32,
    /// Rate-limit pauses taken
    pub pauses: u32,
    /// Last throttling signal seen
    pub last_rate_limit: Option<RateLimitInfo>,
    /// Outcome counters across all passes
    pub stats: WorkerStats,
}

impl BatchOutcome {
    pub(crate) fn new() -> Self {
        Self {
            state: BatchState::Completed,
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
            unresolved: Vec::new(),
            passes: 0,
            pauses: 0,
            last_rate_limit: None,
            stats: WorkerStats::new(),
        }
    }

    /// Whether any unit ended failed
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Units that reached a terminal status
    pub fn terminal_count(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}
