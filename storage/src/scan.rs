//! Discovery of unit directories in an artifact tree

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tierbench_core::{ArtifactLayout, EvalError, EvalResult, UnitKey};

use crate::classify::{classify, fallback_judge_slots, UnitState};

/// Classification of every unit found under a results directory
///
/// A snapshot: repairs do not update it. Re-scan to see their effect.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Judge slots each unit was checked against
    pub judge_count: usize,
    /// State per unit
    pub units: BTreeMap<UnitKey, UnitState>,
    /// Fallback judge slots of units whose slots are all present
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fallback_slots: BTreeMap<UnitKey, Vec<u32>>,
    /// Directories that looked like run directories but could not be keyed
    pub ignored: Vec<PathBuf>,
}

impl ScanReport {
    /// Units in `state`, in key order
    pub fn keys_in(&self, state: UnitState) -> Vec<UnitKey> {
        self.units
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of units per state, every state included
    pub fn counts(&self) -> BTreeMap<UnitState, usize> {
        let mut counts: BTreeMap<UnitState, usize> =
            UnitState::all().iter().map(|s| (*s, 0)).collect();
        for state in self.units.values() {
            *counts.entry(*state).or_default() += 1;
        }
        counts
    }

    /// Units with at least one fallback judge slot, in key order
    pub fn fallback_keys(&self) -> Vec<UnitKey> {
        self.fallback_slots.keys().cloned().collect()
    }

    fn insert(&mut self, layout: &ArtifactLayout, key: UnitKey) {
        let unit_dir = layout.unit_dir(&key);
        let state = classify(&unit_dir, self.judge_count);
        if matches!(state, UnitState::ResultsOnly | UnitState::Complete) {
            let slots: Vec<u32> = fallback_judge_slots(&unit_dir, self.judge_count).collect();
            if !slots.is_empty() {
                self.fallback_slots.insert(key.clone(), slots);
            }
        }
        self.units.insert(key, state);
    }

    /// Whether every unit is complete
    pub fn is_complete(&self) -> bool {
        self.units.values().all(|s| *s == UnitState::Complete)
    }
}

/// Walk `<root>/<tier>/<subtest>/run_NN` and classify each unit once
///
/// `expected` adds units the walk cannot see because their directory was
/// never created; they classify as [`UnitState::Missing`].
pub fn scan(
    layout: &ArtifactLayout,
    judge_count: usize,
    expected: &[UnitKey],
) -> EvalResult<ScanReport> {
    let mut report = ScanReport {
        judge_count,
        ..Default::default()
    };

    if layout.root().is_dir() {
        for tier in subdirs(layout.root())? {
            for subtest in subdirs(&tier)? {
                for run in subdirs(&subtest)? {
                    match key_for(&tier, &subtest, &run) {
                        Some(key) => report.insert(layout, key),
                        None => report.ignored.push(run),
                    }
                }
            }
        }
    }

    for key in expected {
        if !report.units.contains_key(key) {
            report.insert(layout, key.clone());
        }
    }

    tracing::info!(
        root = %layout.root().display(),
        units = report.units.len(),
        fallback_units = report.fallback_slots.len(),
        ignored = report.ignored.len(),
        "Scanned artifact tree"
    );
    Ok(report)
}

fn subdirs(dir: &Path) -> EvalResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| EvalError::io(dir, e))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EvalError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn key_for(tier: &Path, subtest: &Path, run: &Path) -> Option<UnitKey> {
    let name = |p: &Path| p.file_name().and_then(|n| n.to_str()).map(str::to_owned);
    let run_number = name(run)?.strip_prefix("run_")?.parse::<u32>().ok()?;
    Some(UnitKey::new(name(tier)?, name(subtest)?, run_number))
}
