//! Result types: agent output, judge verdicts, and consolidated run results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::consensus::{consensus, Consensus, Grade, TiePolicy};
use crate::task::UnitKey;

/// Token usage of one agent execution
///
/// `cache_read_tokens` is reported separately from `input_tokens` by the
/// provider. Both count toward the input side; see [`TokenStats::total_input`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    /// Fresh (uncached) input tokens
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens generated
    #[serde(default)]
    pub output_tokens: u64,
    /// Input tokens served from the prompt cache
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Input tokens written to the prompt cache
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl TokenStats {
    /// Create token stats
    pub fn new(
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_creation_tokens,
        }
    }

    /// All input tokens seen by the model: fresh plus cache reads
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens
    }

    /// Input plus output
    pub fn total(&self) -> u64 {
        self.total_input() + self.output_tokens
    }
}

impl std::ops::Add for TokenStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cache_read_tokens: self.cache_read_tokens + rhs.cache_read_tokens,
            cache_creation_tokens: self.cache_creation_tokens + rhs.cache_creation_tokens,
        }
    }
}

impl std::ops::AddAssign for TokenStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for TokenStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, s| acc + s)
    }
}

/// Externally imposed throttling detected for a call or a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// Where the signal was found (e.g. "agent", "judge", "preflight", "stderr")
    pub source: String,
    /// Provider-stated wait, if one could be parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
    /// Raw matching message
    pub message: String,
    /// When the signal was observed
    pub detected_at: DateTime<Utc>,
}

impl std::fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.retry_after_seconds {
            Some(secs) => write!(
                f,
                "rate limited ({}), retry after {:.0}s: {}",
                self.source, secs, self.message
            ),
            None => write!(f, "rate limited ({}): {}", self.source, self.message),
        }
    }
}

/// What an agent backend returns for one execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Token usage
    pub token_stats: TokenStats,
    /// Monetary cost in USD
    pub cost_usd: f64,
    /// Wall-clock duration
    pub duration: Duration,
}

/// Raw agent record persisted next to the captured logs (`agent/output.json`)
///
/// This is the source of truth the derived [`AgentResult`] is rebuilt from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAgentOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Token usage as reported by the backend
    #[serde(default)]
    pub usage: TokenStats,
    /// Monetary cost in USD
    #[serde(default)]
    pub cost_usd: f64,
    /// Wall-clock duration in seconds
    #[serde(default)]
    pub duration_seconds: f64,
    /// When the execution finished
    pub finished_at: DateTime<Utc>,
}

impl RawAgentOutput {
    /// Capture the persisted fields of an agent output
    pub fn from_output(output: &AgentOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            usage: output.token_stats,
            cost_usd: output.cost_usd,
            duration_seconds: output.duration.as_secs_f64(),
            finished_at: Utc::now(),
        }
    }
}

/// Derived summary of one agent execution (`agent/result.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout, relative to the unit directory
    pub stdout_path: PathBuf,
    /// Captured stderr, relative to the unit directory
    pub stderr_path: PathBuf,
    /// Token usage
    pub token_stats: TokenStats,
    /// Wall-clock duration in seconds
    pub duration_seconds: f64,
    /// Monetary cost in USD
    pub cost_usd: f64,
    /// Throttling signal seen in this execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<RateLimitInfo>,
}

impl AgentResult {
    /// Build the summary from the raw record
    pub fn from_raw(
        raw: &RawAgentOutput,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        rate_limit_info: Option<RateLimitInfo>,
    ) -> Self {
        Self {
            exit_code: raw.exit_code,
            stdout_path,
            stderr_path,
            token_stats: raw.usage,
            duration_seconds: raw.duration_seconds,
            cost_usd: raw.cost_usd,
            rate_limit_info,
        }
    }

    /// Whether the agent process exited cleanly
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// One judge's verdict for an agent result (`judge/judge_NN/result.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    /// Judge model identifier
    pub judge_model: String,
    /// 1-based judge slot
    pub judge_number: u32,
    /// Score in [0, 1]
    pub score: f64,
    /// Pass/fail verdict
    pub passed: bool,
    /// Letter grade
    pub grade: Grade,
    /// Free-text reasoning
    #[serde(default)]
    pub reasoning: String,
    /// Set when the heuristic fallback stood in for a failed judge
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    /// Error that triggered the fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Judge wall-clock duration in seconds
    #[serde(default)]
    pub duration_seconds: f64,
}

impl JudgeResult {
    /// Whether the score can take part in consensus
    pub fn is_valid(&self) -> bool {
        self.score.is_finite() && (0.0..=1.0).contains(&self.score)
    }
}

/// Timing data for one phase, written even when the phase fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    /// Phase start
    pub started_at: DateTime<Utc>,
    /// Phase end
    pub finished_at: DateTime<Utc>,
    /// Duration in seconds
    pub duration_seconds: f64,
    /// Failure that ended the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseTiming {
    /// Timing for a phase that started at `started_at` and ends now
    pub fn finish(started_at: DateTime<Utc>, error: Option<String>) -> Self {
        let finished_at = Utc::now();
        let duration_seconds = (finished_at - started_at)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1_000_000.0;
        Self {
            started_at,
            finished_at,
            duration_seconds,
            error,
        }
    }
}

/// Consolidated result of one unit (`run_result.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Unit identity
    pub unit: UnitKey,
    /// Agent summary
    pub agent: AgentResult,
    /// One entry per judge slot, in slot order
    pub judges: Vec<JudgeResult>,
    /// Folded judge verdict
    pub consensus: Consensus,
    /// Fresh input plus cache-read tokens
    pub tokens_input: u64,
    /// Output tokens
    pub tokens_output: u64,
    /// Agent phase duration in seconds
    pub agent_duration_seconds: f64,
    /// Sum of judge durations in seconds
    pub judge_duration_seconds: f64,
    /// Agent cost in USD
    pub cost_usd: f64,
    /// When this result was assembled
    pub created_at: DateTime<Utc>,
}

impl RunResult {
    /// Consolidate an agent result and its judge results
    ///
    /// Returns `None` when there is no judge result yet: a run result is
    /// only created once both phases produced something.
    pub fn assemble(
        unit: UnitKey,
        agent: AgentResult,
        mut judges: Vec<JudgeResult>,
        tie_policy: TiePolicy,
    ) -> Option<Self> {
        if judges.is_empty() {
            return None;
        }
        judges.sort_by_key(|j| j.judge_number);
        let consensus = consensus(&judges, tie_policy);
        let judge_duration_seconds = judges.iter().map(|j| j.duration_seconds).sum();
        Some(Self {
            unit,
            tokens_input: agent.token_stats.total_input(),
            tokens_output: agent.token_stats.output_tokens,
            agent_duration_seconds: agent.duration_seconds,
            judge_duration_seconds,
            cost_usd: agent.cost_usd,
            agent,
            judges,
            consensus,
            created_at: Utc::now(),
        })
    }

    /// Agent plus judge time
    pub fn total_duration_seconds(&self) -> f64 {
        self.agent_duration_seconds + self.judge_duration_seconds
    }

    /// Whether any judge slot was filled by the fallback
    pub fn used_fallback(&self) -> bool {
        self.judges.iter().any(|j| j.fallback)
    }
}
