//! Rate-limit detection and coordinated backoff
//!
//! Providers throttle in many dialects: HTTP 429s, "overloaded" errors,
//! "you've hit your limit" banners on stderr. The detector turns any of
//! those into a [`RateLimitInfo`](crate::result::RateLimitInfo); the
//! coordinator turns that into one checkpointed, cancellable pause for the
//! whole batch.
//!
//! Detection runs at three points:
//!
//! 1. Pre-flight, before a sweep starts ([`preflight_check`])
//! 2. Per unit, on the agent's captured output and on throttled judge calls
//! 3. Post-hoc, after a pool broke ([`detect_post_hoc`])

mod coordinator;
mod detect;

pub use coordinator::{RateLimitCoordinator, WaitOutcome, MAX_HONORED_WAIT};
pub use detect::{
    apply_safety_buffer, detect_post_hoc, detect_rate_limit, parse_retry_after, preflight_check,
    DEFAULT_RETRY_AFTER_SECS,
};
