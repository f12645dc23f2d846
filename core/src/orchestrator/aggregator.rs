//! Roll-ups of run results per subtest, tier, and experiment
//!
//! Every aggregate is a plain sum with a zero identity, so merging is
//! commutative and associative and partial roll-ups can be combined in
//! any order. Means are derived on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Add;

use crate::result::{RunResult, TokenStats};

/// Additive summary of a set of run results
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRollup {
    /// Runs folded in
    pub runs: u64,
    /// Runs whose consensus passed
    pub passed: u64,
    /// Runs with a defined consensus score
    pub scored: u64,
    /// Sum of defined consensus scores
    pub score_sum: f64,
    /// Runs where at least one judge slot fell back to the heuristic
    pub fallback_runs: u64,
    /// Agent token usage
    pub tokens: TokenStats,
    /// Agent cost in USD
    pub cost_usd: f64,
    /// Agent time in seconds
    pub agent_duration_seconds: f64,
    /// Judge time in seconds
    pub judge_duration_seconds: f64,
}

impl RunRollup {
    /// The identity: aggregating nothing
    pub fn zero() -> Self {
        Self::default()
    }

    /// Roll-up of a single run
    pub fn from_run(run: &RunResult) -> Self {
        let score = run.consensus.score();
        Self {
            runs: 1,
            passed: u64::from(run.consensus.passed() == Some(true)),
            scored: u64::from(score.is_some()),
            score_sum: score.unwrap_or(0.0),
            fallback_runs: u64::from(run.used_fallback()),
            tokens: run.agent.token_stats,
            cost_usd: run.cost_usd,
            agent_duration_seconds: run.agent_duration_seconds,
            judge_duration_seconds: run.judge_duration_seconds,
        }
    }

    /// Combine two roll-ups
    pub fn merge(self, other: Self) -> Self {
        Self {
            runs: self.runs + other.runs,
            passed: self.passed + other.passed,
            scored: self.scored + other.scored,
            score_sum: self.score_sum + other.score_sum,
            fallback_runs: self.fallback_runs + other.fallback_runs,
            tokens: self.tokens + other.tokens,
            cost_usd: self.cost_usd + other.cost_usd,
            agent_duration_seconds: self.agent_duration_seconds + other.agent_duration_seconds,
            judge_duration_seconds: self.judge_duration_seconds + other.judge_duration_seconds,
        }
    }

    /// Mean consensus score over scored runs
    pub fn mean_score(&self) -> Option<f64> {
        (self.scored > 0).then(|| self.score_sum / self.scored as f64)
    }

    /// Share of runs that passed
    pub fn pass_rate(&self) -> Option<f64> {
        (self.runs > 0).then(|| self.passed as f64 / self.runs as f64)
    }

    /// Mean agent cost per run
    pub fn mean_cost_usd(&self) -> Option<f64> {
        (self.runs > 0).then(|| self.cost_usd / self.runs as f64)
    }

    /// Cost per passing run
    pub fn cost_per_pass_usd(&self) -> Option<f64> {
        (self.passed > 0).then(|| self.cost_usd / self.passed as f64)
    }
}

impl Add for RunRollup {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.merge(rhs)
    }
}

impl std::iter::Sum for RunRollup {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

/// Roll-up of one tier, broken down by subtest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierAggregate {
    /// Whole-tier totals
    pub totals: RunRollup,
    /// Per-subtest totals
    pub subtests: BTreeMap<String, RunRollup>,
}

impl TierAggregate {
    /// Fold in one run
    pub fn add_run(&mut self, run: &RunResult) {
        let rollup = RunRollup::from_run(run);
        self.totals = self.totals + rollup;
        let entry = self.subtests.entry(run.unit.subtest_id.clone()).or_default();
        *entry = *entry + rollup;
    }

    /// Combine two tier aggregates
    pub fn merge(mut self, other: Self) -> Self {
        self.totals = self.totals + other.totals;
        for (subtest, rollup) in other.subtests {
            let entry = self.subtests.entry(subtest).or_default();
            *entry = *entry + rollup;
        }
        self
    }
}

/// Roll-up of a whole experiment, broken down by tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAggregate {
    /// Experiment-wide totals
    pub totals: RunRollup,
    /// Per-tier aggregates
    pub tiers: BTreeMap<String, TierAggregate>,
}

impl ExperimentAggregate {
    /// Aggregate a set of runs
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a RunResult>) -> Self {
        let mut aggregate = Self::default();
        for run in runs {
            aggregate.add_run(run);
        }
        aggregate
    }

    /// Fold in one run
    pub fn add_run(&mut self, run: &RunResult) {
        self.totals = self.totals + RunRollup::from_run(run);
        self.tiers
            .entry(run.unit.tier_id.clone())
            .or_default()
            .add_run(run);
    }

    /// Combine two experiment aggregates
    pub fn merge(mut self, other: Self) -> Self {
        self.totals = self.totals + other.totals;
        for (tier, aggregate) in other.tiers {
            let merged = match self.tiers.remove(&tier) {
                Some(existing) => existing.merge(aggregate),
                None => aggregate,
            };
            self.tiers.insert(tier, merged);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{Grade, TiePolicy};
    use crate::result::{AgentResult, JudgeResult};
    use crate::task::UnitKey;
    use std::path::PathBuf;

    // Dyadic values keep float sums exact regardless of order
    fn run(tier: &str, subtest: &str, n: u32, score: f64, passed: bool, cost: f64) -> RunResult {
        let agent = AgentResult {
            exit_code: 0,
            stdout_path: PathBuf::from("agent/stdout.log"),
            stderr_path: PathBuf::from("agent/stderr.log"),
            token_stats: TokenStats::new(10 * n as u64, 5, 100, 0),
            duration_seconds: 2.0,
            cost_usd: cost,
            rate_limit_info: None,
        };
        let judge = JudgeResult {
            judge_model: "m".into(),
            judge_number: 1,
            score,
            passed,
            grade: Grade::from_score(score),
            reasoning: String::new(),
            fallback: false,
            fallback_reason: None,
            duration_seconds: 0.5,
        };
        RunResult::assemble(UnitKey::new(tier, subtest, n), agent, vec![judge], TiePolicy::NotPassed)
            .unwrap()
    }

    fn sample() -> Vec<RunResult> {
        vec![
            run("T0", "a", 1, 0.75, true, 0.25),
            run("T0", "b", 1, 0.25, false, 0.5),
            run("T1", "a", 1, 1.0, true, 0.125),
            run("T1", "a", 2, 0.5, true, 0.25),
        ]
    }

    #[test]
    fn test_zero_identity() {
        let empty = ExperimentAggregate::from_runs(&[]);
        assert_eq!(empty, ExperimentAggregate::default());
        assert_eq!(empty.totals, RunRollup::zero());
        assert_eq!(empty.totals.mean_score(), None);
        assert_eq!(empty.totals.pass_rate(), None);

        let r = RunRollup::from_run(&sample()[0]);
        assert_eq!(r + RunRollup::zero(), r);
        assert_eq!(RunRollup::zero() + r, r);
    }

    #[test]
    fn test_rollup_commutative_and_associative() {
        let runs = sample();
        let [a, b, c, d] = [0, 1, 2, 3].map(|i| RunRollup::from_run(&runs[i]));
        assert_eq!(a + b, b + a);
        assert_eq!((a + b) + c, a + (b + c));
        let forward: RunRollup = [a, b, c, d].into_iter().sum();
        let backward: RunRollup = [d, c, b, a].into_iter().sum();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_experiment_merge_order_independent() {
        let runs = sample();
        let whole = ExperimentAggregate::from_runs(&runs);
        let left = ExperimentAggregate::from_runs(&runs[..1]);
        let right = ExperimentAggregate::from_runs(&runs[1..]);
        assert_eq!(left.clone().merge(right.clone()), whole);
        assert_eq!(right.merge(left), whole);
    }

    #[test]
    fn test_breakdown_and_means() {
        let aggregate = ExperimentAggregate::from_runs(&sample());
        assert_eq!(aggregate.totals.runs, 4);
        assert_eq!(aggregate.totals.passed, 3);
        assert_eq!(aggregate.totals.mean_score(), Some(0.625));
        assert_eq!(aggregate.totals.cost_usd, 1.125);

        let t1 = &aggregate.tiers["T1"];
        assert_eq!(t1.totals.runs, 2);
        assert_eq!(t1.subtests["a"].runs, 2);
        assert_eq!(t1.totals.pass_rate(), Some(1.0));
        assert_eq!(t1.totals.cost_per_pass_usd(), Some(0.1875));

        let t0 = &aggregate.tiers["T0"];
        assert_eq!(t0.subtests.len(), 2);
        // Cache reads count toward input tokens
        assert_eq!(t0.totals.tokens.total_input(), 10 + 100 + 10 + 100);
    }

    #[test]
    fn test_undefined_consensus_counts_run_but_not_score() {
        let mut undefined = run("T0", "a", 1, 0.5, true, 0.0);
        undefined.consensus = crate::consensus::Consensus::Undefined;
        let rollup = RunRollup::from_run(&undefined);
        assert_eq!(rollup.runs, 1);
        assert_eq!(rollup.scored, 0);
        assert_eq!(rollup.passed, 0);
        assert_eq!(rollup.mean_score(), None);
    }
}
