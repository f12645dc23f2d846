//! Outcome counters for a batch of units

use std::time::Instant;

use super::outcome::UnitOutcome;

/// Statistics over the outcomes a batch produced
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    /// Units that completed
    pub completed: usize,

    /// Units that failed on their own
    pub worker_failures: usize,

    /// Outcomes that broke the pool
    pub pool_failures: usize,

    /// Outcomes that reported throttling
    pub rate_limited: usize,

    /// Input tokens (fresh plus cache reads) of completed units
    pub input_tokens: u64,

    /// Output tokens of completed units
    pub output_tokens: u64,

    /// Agent cost of completed units
    pub cost_usd: f64,

    /// Start time
    pub started_at: Option<Instant>,

    /// End time
    pub ended_at: Option<Instant>,
}

impl WorkerStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking (records start time)
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stop tracking (records end time)
    pub fn stop(&mut self) {
        self.ended_at = Some(Instant::now());
    }

    /// Count one outcome
    pub fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Success(run) => {
                self.completed += 1;
                self.input_tokens += run.tokens_input;
                self.output_tokens += run.tokens_output;
                self.cost_usd += run.cost_usd;
            }
            UnitOutcome::WorkerFailure { .. } => self.worker_failures += 1,
            UnitOutcome::PoolFailure { .. } => self.pool_failures += 1,
            UnitOutcome::RateLimited(_) => self.rate_limited += 1,
        }
    }

    /// All outcomes counted
    pub fn total_outcomes(&self) -> usize {
        self.completed + self.worker_failures + self.pool_failures + self.rate_limited
    }

    /// Share of outcomes that completed (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_outcomes() == 0 {
            0.0
        } else {
            self.completed as f64 / self.total_outcomes() as f64
        }
    }

    /// Elapsed time since start
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.started_at.map(|start| {
            self.ended_at
                .map(|end| end.duration_since(start))
                .unwrap_or_else(|| start.elapsed())
        })
    }

    /// Merge stats from another batch
    pub fn merge(&mut self, other: &WorkerStats) {
        self.completed += other.completed;
        self.worker_failures += other.worker_failures;
        self.pool_failures += other.pool_failures;
        self.rate_limited += other.rate_limited;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}
