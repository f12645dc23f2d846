//! Pure completeness classification of one unit directory

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;

use tierbench_core::{AgentResult, JudgeResult, RawAgentOutput, RunResult, UnitDir};

/// How far a unit got, judged from its artifacts alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// No agent artifacts at all
    Missing,
    /// The agent ran but produced no usable output, or was throttled
    Failed,
    /// Raw agent output exists but `agent/result.json` does not
    AgentSummaryMissing,
    /// Agent summary exists but at least one judge slot has no result
    JudgePending,
    /// Agent and every judge slot exist but `run_result.json` does not
    ResultsOnly,
    /// Everything is in place
    Complete,
}

impl UnitState {
    /// Whether the agent has to run again
    pub fn needs_agent(&self) -> bool {
        matches!(self, UnitState::Missing | UnitState::Failed)
    }

    /// Every state, in pipeline order
    pub fn all() -> &'static [UnitState] {
        &[
            UnitState::Missing,
            UnitState::Failed,
            UnitState::AgentSummaryMissing,
            UnitState::JudgePending,
            UnitState::ResultsOnly,
            UnitState::Complete,
        ]
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitState::Missing => "missing",
            UnitState::Failed => "failed",
            UnitState::AgentSummaryMissing => "agent_summary_missing",
            UnitState::JudgePending => "judge_pending",
            UnitState::ResultsOnly => "results_only",
            UnitState::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Classify a unit directory against `judge_count` configured judge slots
///
/// Reads files only; never writes. Unparseable files count as absent.
pub fn classify(unit_dir: &UnitDir, judge_count: usize) -> UnitState {
    if !unit_dir.exists() {
        return UnitState::Missing;
    }

    let Some(agent) = parse::<AgentResult>(&unit_dir.agent_result()) else {
        if parse::<RawAgentOutput>(&unit_dir.agent_output()).is_some() {
            return UnitState::AgentSummaryMissing;
        }
        let attempted = unit_dir.agent_timing().exists() || unit_dir.agent_stderr().exists();
        return if attempted {
            UnitState::Failed
        } else {
            UnitState::Missing
        };
    };

    // Throttled runs are recorded but never judged
    if agent.rate_limit_info.is_some() {
        return UnitState::Failed;
    }

    if missing_judge_slots(unit_dir, judge_count).next().is_some() {
        return UnitState::JudgePending;
    }

    match parse::<RunResult>(&unit_dir.run_result()) {
        Some(_) => UnitState::Complete,
        None => UnitState::ResultsOnly,
    }
}

/// Judge slots (1-based) without a readable `result.json`
pub fn missing_judge_slots(unit_dir: &UnitDir, judge_count: usize) -> impl Iterator<Item = u32> + '_ {
    (1..=judge_count as u32).filter(move |&n| parse::<JudgeResult>(&unit_dir.judge_result(n)).is_none())
}

/// Judge slots (1-based) whose result is a heuristic fallback
///
/// Fallback slots count as done for [`classify`]; only an explicit repair
/// re-runs them.
pub fn fallback_judge_slots(unit_dir: &UnitDir, judge_count: usize) -> impl Iterator<Item = u32> + '_ {
    (1..=judge_count as u32).filter(move |&n| {
        parse::<JudgeResult>(&unit_dir.judge_result(n)).is_some_and(|r| r.fallback)
    })
}

fn parse<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{write_agent_raw, write_agent_result, write_judge, write_run_result, fixture_unit};
    use tierbench_core::{ArtifactLayout, UnitKey};

    #[test]
    fn test_absent_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let unit = layout.unit_dir(&UnitKey::new("T0", "s01", 1));
        assert_eq!(classify(&unit, 3), UnitState::Missing);
    }

    #[test]
    fn test_pipeline_progression() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, key) = fixture_unit(dir.path());
        let unit = layout.unit_dir(&key);

        std::fs::create_dir_all(unit.workspace()).unwrap();
        assert_eq!(classify(&unit, 2), UnitState::Missing);

        write_agent_raw(&unit, 0, 33, 195_735);
        assert_eq!(classify(&unit, 2), UnitState::AgentSummaryMissing);

        write_agent_result(&unit, 0, 33, 195_735, false);
        assert_eq!(classify(&unit, 2), UnitState::JudgePending);

        write_judge(&unit, 1, 0.9, true, false);
        assert_eq!(classify(&unit, 2), UnitState::JudgePending);
        assert_eq!(missing_judge_slots(&unit, 2).collect::<Vec<_>>(), [2]);

        write_judge(&unit, 2, 0.7, true, true);
        assert_eq!(classify(&unit, 2), UnitState::ResultsOnly);

        write_run_result(&unit, &key);
        assert_eq!(classify(&unit, 2), UnitState::Complete);

        // A third configured judge reopens the unit
        assert_eq!(classify(&unit, 3), UnitState::JudgePending);
    }

    #[test]
    fn test_fallback_slots_listed_but_unit_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, key) = fixture_unit(dir.path());
        let unit = layout.unit_dir(&key);
        write_agent_raw(&unit, 0, 1, 1);
        write_agent_result(&unit, 0, 1, 1, false);
        write_judge(&unit, 1, 0.9, true, false);
        write_judge(&unit, 2, 0.6, true, true);
        write_judge(&unit, 3, 0.6, true, true);
        write_run_result(&unit, &key);

        assert_eq!(classify(&unit, 3), UnitState::Complete);
        assert_eq!(fallback_judge_slots(&unit, 3).collect::<Vec<_>>(), [2, 3]);
        assert_eq!(fallback_judge_slots(&unit, 1).count(), 0);
    }

    #[test]
    fn test_crashed_agent_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, key) = fixture_unit(dir.path());
        let unit = layout.unit_dir(&key);
        std::fs::create_dir_all(unit.agent_dir()).unwrap();
        std::fs::write(unit.agent_timing(), "{}").unwrap();
        assert_eq!(classify(&unit, 1), UnitState::Failed);
    }

    #[test]
    fn test_throttled_agent_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, key) = fixture_unit(dir.path());
        let unit = layout.unit_dir(&key);
        write_agent_raw(&unit, 1, 0, 0);
        write_agent_result(&unit, 1, 0, 0, true);
        assert_eq!(classify(&unit, 1), UnitState::Failed);
    }

    #[test]
    fn test_corrupt_judge_result_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, key) = fixture_unit(dir.path());
        let unit = layout.unit_dir(&key);
        write_agent_raw(&unit, 0, 1, 1);
        write_agent_result(&unit, 0, 1, 1, false);
        write_judge(&unit, 1, 0.5, true, false);
        std::fs::write(unit.judge_result(1), "{ truncated").unwrap();
        assert_eq!(classify(&unit, 1), UnitState::JudgePending);
    }

    #[test]
    fn test_classify_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, key) = fixture_unit(dir.path());
        let unit = layout.unit_dir(&key);
        write_agent_raw(&unit, 0, 1, 1);
        let before: Vec<_> = walk(dir.path());
        classify(&unit, 2);
        assert_eq!(walk(dir.path()), before);
    }

    fn walk(root: &Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path.clone());
                }
                out.push(path);
            }
        }
        out.sort();
        out
    }
}
