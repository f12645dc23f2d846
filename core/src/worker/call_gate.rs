//! Limits on external calls: pacing and a cross-tier concurrency cap

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{EvalError, EvalResult};

/// Paces external calls using a token bucket via the governor crate
///
/// Share one instance via `Arc` to pace every worker of every tier together.
pub struct CallPacer {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    calls_per_second: Option<f64>,
}

impl CallPacer {
    /// Create a pacer
    ///
    /// `None` or a non-positive rate disables pacing.
    ///
    /// # Examples
    /// ```
    /// use tierbench_core::worker::CallPacer;
    ///
    /// let paced = CallPacer::new(Some(2.0));
    /// assert!(paced.is_enabled());
    ///
    /// let unpaced = CallPacer::new(None);
    /// assert!(!unpaced.is_enabled());
    /// ```
    pub fn new(calls_per_second: Option<f64>) -> Self {
        let limiter = calls_per_second
            .and_then(quota_for)
            .map(RateLimiter::direct);

        Self {
            limiter,
            calls_per_second,
        }
    }

    /// Wait until the next call is allowed
    pub async fn wait(&self) {
        if let Some(ref limiter) = self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Whether pacing is enabled
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Configured rate
    pub fn calls_per_second(&self) -> Option<f64> {
        self.calls_per_second
    }
}

/// Quota for a positive rate
///
/// Whole rates allow a burst of that many calls per second. Fractional
/// rates allow one call per `1 / cps` seconds.
fn quota_for(cps: f64) -> Option<Quota> {
    if !cps.is_finite() || cps <= 0.0 {
        return None;
    }
    if cps >= 1.0 && cps.fract() == 0.0 && cps <= u32::MAX as f64 {
        return Some(Quota::per_second(NonZeroU32::new(cps as u32)?));
    }
    Quota::with_period(Duration::try_from_secs_f64(1.0 / cps).ok()?)
}

impl Default for CallPacer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for CallPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPacer")
            .field("calls_per_second", &self.calls_per_second)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Permit for one external call; released on drop
#[derive(Debug)]
pub struct CallPermit {
    _global: Option<OwnedSemaphorePermit>,
}

/// Gate every agent and judge call passes through
///
/// Cloning shares the pacer and the global semaphore.
#[derive(Debug, Clone, Default)]
pub struct CallGate {
    pacer: Arc<CallPacer>,
    global: Option<Arc<Semaphore>>,
}

impl CallGate {
    /// Gate with optional pacing and an optional global call cap
    pub fn new(calls_per_second: Option<f64>, global_limit: Option<usize>) -> Self {
        Self {
            pacer: Arc::new(CallPacer::new(calls_per_second)),
            global: global_limit.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Gate that never waits
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Wait for pacing, then for a global slot
    pub async fn acquire(&self) -> EvalResult<CallPermit> {
        self.pacer.wait().await;
        let global = match &self.global {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| EvalError::shutdown())?,
            ),
            None => None,
        };
        Ok(CallPermit { _global: global })
    }

    /// Free global slots, if a cap is configured
    pub fn available_global(&self) -> Option<usize> {
        self.global.as_ref().map(|s| s.available_permits())
    }
}
