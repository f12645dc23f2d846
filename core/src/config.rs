//! Experiment configuration types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::consensus::TiePolicy;

/// Experiment configuration
///
/// Defines the tier/subtest/run sweep, the judge panel, and how the
/// scheduler should run it: concurrency, retry bound, and call limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment identifier, stored in the checkpoint to guard resumes
    pub experiment_id: String,

    /// Root directory for all artifacts of this experiment
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Tiers under evaluation
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Repeated runs per (tier, subtest)
    #[serde(default = "default_runs_per_subtest")]
    pub runs_per_subtest: u32,

    /// Judge models, one judge slot each
    #[serde(default)]
    pub judges: Vec<String>,

    /// Worker pool size per tier
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum pool rebuild cycles per batch
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How an exact split of judge votes is decided
    #[serde(default)]
    pub tie_policy: TiePolicy,

    /// Cap on simultaneous external calls across all tiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_call_limit: Option<usize>,

    /// Optional pacing of external calls (calls per second)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calls_per_second: Option<f64>,

    /// Number of tiers scheduled at the same time
    #[serde(default = "default_tier_parallelism")]
    pub tier_parallelism: usize,

    /// Issue a probe call before starting the sweep
    #[serde(default = "default_true")]
    pub preflight: bool,

    /// Timeout for the pre-flight probe, in seconds
    #[serde(default = "default_preflight_timeout_secs")]
    pub preflight_timeout_secs: u64,

    /// Upper bound for a single rate-limit backoff, in seconds
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Agent backend command
    #[serde(default)]
    pub agent: CommandConfig,

    /// Judge backend command
    #[serde(default)]
    pub judge: CommandConfig,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_runs_per_subtest() -> u32 {
    1
}

fn default_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_tier_parallelism() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_preflight_timeout_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    3600
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment_id: String::new(),
            results_dir: default_results_dir(),
            tiers: Vec::new(),
            runs_per_subtest: default_runs_per_subtest(),
            judges: Vec::new(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            tie_policy: TiePolicy::default(),
            global_call_limit: None,
            calls_per_second: None,
            tier_parallelism: default_tier_parallelism(),
            preflight: true,
            preflight_timeout_secs: default_preflight_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            agent: CommandConfig::default(),
            judge: CommandConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Create a new config with the given experiment id
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            ..Default::default()
        }
    }

    /// Load a config from a YAML or JSON file, chosen by extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&text)
                .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
        } else {
            serde_yaml::from_str(&text)
                .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
        }
    }

    /// Set the results directory
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Add a tier
    pub fn with_tier(mut self, tier: TierConfig) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Set runs per subtest
    pub fn with_runs_per_subtest(mut self, runs: u32) -> Self {
        self.runs_per_subtest = runs;
        self
    }

    /// Set the judge models
    pub fn with_judges(mut self, judges: Vec<String>) -> Self {
        self.judges = judges;
        self
    }

    /// Set the per-tier pool size
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the pool rebuild bound
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable the pre-flight probe
    pub fn with_preflight(mut self, enabled: bool) -> Self {
        self.preflight = enabled;
        self
    }

    /// Pre-flight probe timeout
    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_secs(self.preflight_timeout_secs)
    }

    /// Longest single backoff
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Total number of units the sweep enumerates
    pub fn total_units(&self) -> usize {
        let subtests: usize = self.tiers.iter().map(|t| t.subtests.len()).sum();
        subtests * self.runs_per_subtest as usize
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experiment_id.trim().is_empty() {
            return Err(ConfigError::MissingField("experiment_id"));
        }
        if self.tiers.is_empty() {
            return Err(ConfigError::MissingField("tiers"));
        }
        if self.judges.is_empty() {
            return Err(ConfigError::MissingField("judges"));
        }
        if self.runs_per_subtest == 0 {
            return Err(ConfigError::InvalidValue(
                "runs_per_subtest must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.tier_parallelism == 0 {
            return Err(ConfigError::InvalidValue(
                "tier_parallelism must be at least 1".into(),
            ));
        }
        if self.global_call_limit == Some(0) {
            return Err(ConfigError::InvalidValue(
                "global_call_limit must be at least 1".into(),
            ));
        }
        if let Some(rate) = self.calls_per_second {
            if rate <= 0.0 || !rate.is_finite() {
                return Err(ConfigError::InvalidValue(
                    "calls_per_second must be positive".into(),
                ));
            }
        }

        let mut tier_ids = HashSet::new();
        for tier in &self.tiers {
            if !is_path_safe(&tier.id) {
                return Err(ConfigError::InvalidId(tier.id.clone()));
            }
            if !tier_ids.insert(tier.id.as_str()) {
                return Err(ConfigError::Duplicate(format!("tier {}", tier.id)));
            }
            if tier.subtests.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "tier {} has no subtests",
                    tier.id
                )));
            }
            let mut subtest_ids = HashSet::new();
            for subtest in &tier.subtests {
                if !is_path_safe(&subtest.id) {
                    return Err(ConfigError::InvalidId(subtest.id.clone()));
                }
                if !subtest_ids.insert(subtest.id.as_str()) {
                    return Err(ConfigError::Duplicate(format!(
                        "subtest {}/{}",
                        tier.id, subtest.id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Ids become directory names and unit key segments
fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// One agent architecture under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier identifier
    pub id: String,
    /// Benchmark tasks run against this tier
    #[serde(default)]
    pub subtests: Vec<SubtestConfig>,
}

impl TierConfig {
    /// Create a tier
    pub fn new(id: impl Into<String>, subtests: Vec<SubtestConfig>) -> Self {
        Self {
            id: id.into(),
            subtests,
        }
    }
}

/// One benchmark task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtestConfig {
    /// Subtest identifier
    pub id: String,
    /// Task prompt
    pub prompt: String,
}

impl SubtestConfig {
    /// Create a subtest
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
        }
    }
}

/// External command used by a subprocess backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Program to execute
    #[serde(default)]
    pub program: String,
    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Per-invocation timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CommandConfig {
    /// Whether a program was configured
    pub fn is_configured(&self) -> bool {
        !self.program.trim().is_empty()
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config: {0}")]
    Read(String),

    /// Config file could not be parsed
    #[error("cannot parse config: {0}")]
    Parse(String),

    /// Required field missing or empty
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Field value out of range
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Identifier not usable as a path segment
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    /// Identifier used twice
    #[error("duplicate {0}")]
    Duplicate(String),
}

impl From<ConfigError> for crate::error::EvalError {
    fn from(err: ConfigError) -> Self {
        crate::error::EvalError::config(err.to_string())
    }
}
