//! Task units: the atomic scheduling unit of an experiment

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::ExperimentConfig;

/// Unique identity of one (tier, subtest, run) execution
///
/// Serializes as `tier/subtest/run_NN` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct UnitKey {
    /// Tier (agent architecture) identifier
    pub tier_id: String,
    /// Subtest identifier within the tier
    pub subtest_id: String,
    /// 1-based run number
    pub run_number: u32,
}

impl UnitKey {
    /// Create a new key
    pub fn new(tier_id: impl Into<String>, subtest_id: impl Into<String>, run_number: u32) -> Self {
        Self {
            tier_id: tier_id.into(),
            subtest_id: subtest_id.into(),
            run_number,
        }
    }

    /// Directory name used for the run component
    pub fn run_dir_name(&self) -> String {
        format!("run_{:02}", self.run_number)
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tier_id, self.subtest_id, self.run_dir_name())
    }
}

/// Error parsing a unit key from its string form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid unit key: {0}")]
pub struct ParseUnitKeyError(String);

impl FromStr for UnitKey {
    type Err = ParseUnitKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let (Some(tier), Some(subtest), Some(run), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseUnitKeyError(s.to_string()));
        };
        if tier.is_empty() || subtest.is_empty() {
            return Err(ParseUnitKeyError(s.to_string()));
        }
        let run_number = run
            .strip_prefix("run_")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| ParseUnitKeyError(s.to_string()))?;
        Ok(Self::new(tier, subtest, run_number))
    }
}

impl From<UnitKey> for String {
    fn from(key: UnitKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for UnitKey {
    type Error = ParseUnitKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One (tier, subtest, run) execution plus its judge assignments
///
/// Immutable once created. Carries no shared mutable state, so it is
/// handed to workers behind an `Arc` without locking.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUnit {
    /// Unit identity
    pub key: UnitKey,
    /// Prompt handed to the agent and, for context, to each judge
    pub task_prompt: Arc<str>,
    /// Judge models, one per judge slot (slot N = index N-1)
    pub judge_models: Arc<[String]>,
}

impl TaskUnit {
    /// Create a new task unit
    pub fn new(key: UnitKey, task_prompt: impl Into<Arc<str>>, judge_models: Vec<String>) -> Self {
        Self {
            key,
            task_prompt: task_prompt.into(),
            judge_models: judge_models.into(),
        }
    }

    /// Tier identifier
    pub fn tier_id(&self) -> &str {
        &self.key.tier_id
    }

    /// Subtest identifier
    pub fn subtest_id(&self) -> &str {
        &self.key.subtest_id
    }

    /// Run number
    pub fn run_number(&self) -> u32 {
        self.key.run_number
    }

    /// Number of configured judge slots
    pub fn judge_count(&self) -> usize {
        self.judge_models.len()
    }
}

/// Enumerate every unit of the experiment in tier, subtest, run order
pub fn enumerate_units(config: &ExperimentConfig) -> Vec<TaskUnit> {
    let judges: Arc<[String]> = config.judges.clone().into();
    let mut units = Vec::new();
    for tier in &config.tiers {
        for subtest in &tier.subtests {
            let prompt: Arc<str> = subtest.prompt.as_str().into();
            for run in 1..=config.runs_per_subtest {
                units.push(TaskUnit {
                    key: UnitKey::new(&tier.id, &subtest.id, run),
                    task_prompt: Arc::clone(&prompt),
                    judge_models: Arc::clone(&judges),
                });
            }
        }
    }
    units
}
