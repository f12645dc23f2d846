//! Core traits for agent and judge backends
//!
//! These traits are defined in core so the scheduler and the consensus
//! aggregator only depend on the capability. Implementations live in the
//! backends crate; tests use deterministic fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::consensus::Grade;
use crate::error::ErrorKind;
use crate::result::{AgentOutput, RateLimitInfo};
use crate::task::TaskUnit;

// ============================================================================
// Agent Executor Trait
// ============================================================================

/// Executes one task unit with the agent architecture under test
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Backend identifier (e.g. "command", "mock")
    fn name(&self) -> &str;

    /// Run the agent for `unit` inside `workspace`
    ///
    /// Implementations must not fail merely because `workspace` does not
    /// exist; they degrade to running without it.
    async fn execute(&self, unit: &TaskUnit, workspace: &Path) -> Result<AgentOutput, AgentError>;

    /// Minimal call used by the pre-flight rate-limit check
    ///
    /// Returns whatever text the provider answered with.
    async fn probe(&self) -> Result<String, AgentError> {
        Ok(String::new())
    }
}

/// Agent backend errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent process could not be started
    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    /// The agent ran longer than allowed
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    /// The provider throttled the call
    #[error("{0}")]
    RateLimited(RateLimitInfo),

    /// The agent process was killed before it could exit
    #[error("agent crashed: {0}")]
    Crashed(String),

    /// The execution substrate itself is unusable; siblings are affected too
    #[error("execution substrate failure: {0}")]
    Substrate(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Convert to ErrorKind for classification
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            AgentError::RateLimited(_) => ErrorKind::RateLimited,
            AgentError::Substrate(_) => ErrorKind::PoolBroken,
            AgentError::Io(_) => ErrorKind::Io,
            AgentError::Spawn(_) | AgentError::Timeout(_) | AgentError::Crashed(_) => {
                ErrorKind::Agent
            }
        }
    }
}

// ============================================================================
// Judge Executor Trait
// ============================================================================

/// Everything a judge needs to score one agent result
///
/// The prompt carries the full evaluation context; `workspace` is optional
/// and is `None` when the unit's workspace directory no longer exists.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
    /// Judge model to use
    pub model: String,
    /// 1-based judge slot
    pub judge_number: u32,
    /// Task prompt given to the agent
    pub task_prompt: String,
    /// Agent stdout
    pub agent_output: String,
    /// Agent exit code
    pub agent_exit_code: i32,
    /// Workspace the agent worked in, if still present
    pub workspace: Option<PathBuf>,
}

/// Verdict returned by a judge backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    /// Score in [0, 1]
    pub score: f64,
    /// Pass/fail verdict
    pub passed: bool,
    /// Letter grade, derived from the score when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<Grade>,
    /// Free-text reasoning
    #[serde(default)]
    pub reasoning: String,
}

/// Scores an agent result against the task rubric
#[async_trait]
pub trait JudgeExecutor: Send + Sync {
    /// Backend identifier
    fn name(&self) -> &str;

    /// Produce a verdict for the request
    async fn judge(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError>;
}

/// Judge backend errors
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    /// The judge ran longer than allowed
    #[error("judge timed out after {0:?}")]
    Timeout(Duration),

    /// The provider throttled the call
    #[error("{0}")]
    RateLimited(RateLimitInfo),

    /// The judge answered with something that is not a verdict
    #[error("invalid judge response: {0}")]
    InvalidResponse(String),

    /// The judge backend failed
    #[error("judge backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JudgeError {
    /// Convert to ErrorKind for classification
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            JudgeError::RateLimited(_) => ErrorKind::RateLimited,
            JudgeError::Io(_) => ErrorKind::Io,
            JudgeError::Timeout(_) | JudgeError::InvalidResponse(_) | JudgeError::Backend(_) => {
                ErrorKind::Judge
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rate_limit(secs: Option<f64>) -> RateLimitInfo {
        RateLimitInfo {
            source: "agent".into(),
            retry_after_seconds: secs,
            message: "429 Too Many Requests".into(),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_agent_error_to_error_kind() {
        assert_eq!(
            AgentError::RateLimited(rate_limit(None)).to_error_kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            AgentError::Substrate("x".into()).to_error_kind(),
            ErrorKind::PoolBroken
        );
        assert_eq!(
            AgentError::Crashed("x".into()).to_error_kind(),
            ErrorKind::Agent
        );
    }

    #[test]
    fn test_judge_error_to_error_kind() {
        assert_eq!(
            JudgeError::InvalidResponse("not json".into()).to_error_kind(),
            ErrorKind::Judge
        );
        assert_eq!(
            JudgeError::RateLimited(rate_limit(Some(5.0))).to_error_kind(),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn test_verdict_grade_optional() {
        let verdict: JudgeVerdict =
            serde_json::from_str(r#"{"score":0.7,"passed":true,"reasoning":"ok"}"#).unwrap();
        assert!(verdict.grade.is_none());
        assert!(verdict.passed);
    }
}
