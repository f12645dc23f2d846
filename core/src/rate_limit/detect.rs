//! Rate-limit signal detection in free text, probes, and failed artifacts

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use crate::layout::{read_text_or_empty, UnitDir};
use crate::result::RateLimitInfo;
use crate::traits::{AgentError, AgentExecutor};

/// Wait assumed when a limit is detected but no duration can be parsed
pub const DEFAULT_RETRY_AFTER_SECS: f64 = 60.0;

const MAX_MESSAGE_LEN: usize = 500;

mod patterns {
    use super::*;

    /// Phrases providers use when throttling
    pub static PHRASE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?i)(rate[ _-]?limit|\b429\b|too many requests|overloaded|hit your limit|quota exceeded|usage limit reached|resource[ _]exhausted)",
        )
        .expect("Invalid rate-limit phrase regex")
    });

    /// `Retry-After: 30` header echoed into logs
    pub static HEADER: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)retry-after:\s*(\d+(?:\.\d+)?)").expect("Invalid retry-after header regex")
    });

    /// `retry after 30 seconds`, `try again in 5 minutes`
    pub static PHRASED_WAIT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?i)(?:retry after|try again in)\s+(\d+(?:\.\d+)?)\s*(hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)?\b",
        )
        .expect("Invalid retry-after phrase regex")
    });
}

/// Look for a throttling signal in `text`
///
/// Returns `None` when no rate-limit phrase is present. When one is, the
/// stated wait is parsed if possible, else [`DEFAULT_RETRY_AFTER_SECS`].
pub fn detect_rate_limit(text: &str, source: &str) -> Option<RateLimitInfo> {
    let found = patterns::PHRASE.find(text)?;
    let line = text[..found.start()]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let line_end = text[found.end()..]
        .find('\n')
        .map(|i| found.end() + i)
        .unwrap_or(text.len());

    Some(RateLimitInfo {
        source: source.to_string(),
        retry_after_seconds: Some(parse_retry_after(text).unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
        message: truncate(text[line..line_end].trim(), MAX_MESSAGE_LEN),
        detected_at: Utc::now(),
    })
}

/// Parse a provider-stated wait in seconds
pub fn parse_retry_after(text: &str) -> Option<f64> {
    if let Some(caps) = patterns::HEADER.captures(text) {
        return caps[1].parse().ok();
    }
    let caps = patterns::PHRASED_WAIT.captures(text)?;
    let value: f64 = caps[1].parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
    let multiplier = match unit.as_deref() {
        Some(u) if u.starts_with('h') => 3600.0,
        Some(u) if u.starts_with('m') => 60.0,
        _ => 1.0,
    };
    Some(value * multiplier)
}

/// Stretch a stated wait by 10%, rounded up, never below the stated wait
pub fn apply_safety_buffer(retry_after_secs: f64) -> u64 {
    if !retry_after_secs.is_finite() || retry_after_secs <= 0.0 {
        return 0;
    }
    let buffered = (retry_after_secs * 1.10).ceil();
    buffered.max(retry_after_secs.ceil()) as u64
}

/// Probe the agent backend before starting a sweep
///
/// Timeouts and unrelated failures are not treated as throttling.
pub async fn preflight_check(agent: &dyn AgentExecutor, timeout: Duration) -> Option<RateLimitInfo> {
    match tokio::time::timeout(timeout, agent.probe()).await {
        Err(_) => {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Pre-flight probe timed out, proceeding"
            );
            None
        }
        Ok(Ok(text)) => detect_rate_limit(&text, "preflight"),
        Ok(Err(AgentError::RateLimited(mut info))) => {
            info.source = "preflight".to_string();
            Some(info)
        }
        Ok(Err(AgentError::Timeout(_))) => None,
        Ok(Err(e)) => {
            let info = detect_rate_limit(&e.to_string(), "preflight");
            if info.is_none() {
                tracing::warn!(error = %e, "Pre-flight probe failed, proceeding");
            }
            info
        }
    }
}

/// Find a throttling signal after a pool broke or units failed
///
/// Sources are scanned in priority order and the first match wins:
/// structured infos, then failure reasons, then the captured agent logs
/// of the failed units.
pub fn detect_post_hoc(
    infos: &[RateLimitInfo],
    reasons: &[String],
    failed_dirs: &[UnitDir],
) -> Option<RateLimitInfo> {
    if let Some(info) = infos.first() {
        return Some(info.clone());
    }
    if let Some(info) = reasons
        .iter()
        .find_map(|reason| detect_rate_limit(reason, "failure_reason"))
    {
        return Some(info);
    }
    for dir in failed_dirs {
        for (path, source) in [(dir.agent_stderr(), "stderr"), (dir.agent_stdout(), "stdout")] {
            let text = match read_text_or_empty(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable log in post-hoc scan");
                    continue;
                }
            };
            if let Some(info) = detect_rate_limit(&text, source) {
                return Some(info);
            }
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
