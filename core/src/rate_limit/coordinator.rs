//! Checkpointed, cancellable backoff

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::channel::Shutdown;
use crate::checkpoint::CheckpointStore;
use crate::error::EvalResult;

use super::detect::apply_safety_buffer;

/// How a backoff ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full wait elapsed
    Completed,
    /// Shutdown cut the wait short; the deadline stays in the checkpoint
    Interrupted,
}

/// Longest stated retry-after honored, whatever the provider claims
pub const MAX_HONORED_WAIT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Computes and performs rate-limit backoffs
#[derive(Debug, Clone)]
pub struct RateLimitCoordinator {
    max_wait: Duration,
}

impl Default for RateLimitCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl RateLimitCoordinator {
    /// Coordinator with a cap on a single wait
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }

    /// Configured cap
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Wait for a stated retry-after
    ///
    /// The buffered wait is capped at `max_wait`, but a stated wait longer
    /// than the cap is still honored in full, up to [`MAX_HONORED_WAIT`].
    pub fn compute_wait(&self, retry_after_secs: f64) -> Duration {
        let buffered = Duration::from_secs(apply_safety_buffer(retry_after_secs));
        let stated = if retry_after_secs.is_finite() && retry_after_secs > 0.0 {
            Duration::from_secs(retry_after_secs.ceil() as u64)
        } else {
            Duration::ZERO
        };
        buffered
            .min(self.max_wait.max(stated))
            .min(MAX_HONORED_WAIT)
    }

    /// Back off for `retry_after_secs`
    ///
    /// The deadline and pause count are persisted before sleeping, so a
    /// crash mid-wait resumes the same pause instead of starting a new one.
    pub async fn wait(
        &self,
        retry_after_secs: f64,
        checkpoint: &CheckpointStore,
        shutdown: &Shutdown,
    ) -> EvalResult<WaitOutcome> {
        let wait = self.compute_wait(retry_after_secs);
        if retry_after_secs > MAX_HONORED_WAIT.as_secs_f64() {
            tracing::warn!(
                retry_after_secs,
                ceiling_secs = MAX_HONORED_WAIT.as_secs(),
                "Stated retry-after exceeds ceiling, clamping"
            );
        }
        let until = deadline_after(wait);
        let pause = checkpoint.begin_pause(until)?;

        tracing::warn!(
            retry_after_secs,
            wait_secs = wait.as_secs(),
            until = %until,
            pause,
            "Rate limited, pausing"
        );
        self.sleep(wait, checkpoint, shutdown).await
    }

    /// Finish a pause that was persisted but not completed
    pub async fn resume_pending_wait(
        &self,
        checkpoint: &CheckpointStore,
        shutdown: &Shutdown,
    ) -> EvalResult<WaitOutcome> {
        let Some(until) = checkpoint.rate_limit_until() else {
            return Ok(WaitOutcome::Completed);
        };
        let remaining = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            checkpoint.clear_rate_limit()?;
            return Ok(WaitOutcome::Completed);
        }

        let remaining = remaining.min(self.max_wait);
        tracing::info!(
            remaining_secs = remaining.as_secs(),
            until = %until,
            "Resuming interrupted rate-limit pause"
        );
        self.sleep(remaining, checkpoint, shutdown).await
    }

    async fn sleep(
        &self,
        wait: Duration,
        checkpoint: &CheckpointStore,
        shutdown: &Shutdown,
    ) -> EvalResult<WaitOutcome> {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Rate-limit pause interrupted by shutdown");
                Ok(WaitOutcome::Interrupted)
            }

            _ = tokio::time::sleep(wait) => {
                checkpoint.clear_rate_limit()?;
                tracing::info!("Rate-limit pause finished");
                Ok(WaitOutcome::Completed)
            }
        }
    }
}

/// `now + wait`, saturating at the latest representable instant
fn deadline_after(wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
