//! Artifact tree classification and result regeneration for tierbench
//!
//! This crate works on a results directory after (or between) runs:
//!
//! - [`classify`]: pure, read-only completeness check of one unit directory
//! - [`scan`]: discover every unit in the tree and classify it once
//! - Repairs that rebuild derived files without re-running finished work:
//!   [`repair_agent_results`], [`repair_run_results`], [`repair_judge_slots`],
//!   and the opt-in [`repair_fallback_slots`]

#![warn(missing_docs)]
#![warn(clippy::all)]

mod classify;
mod repair;
mod scan;

pub use classify::{classify, fallback_judge_slots, missing_judge_slots, UnitState};
pub use repair::{
    repair_agent_results, repair_fallback_slots, repair_judge_slots, repair_run_results,
    RepairReport,
};
pub use scan::{scan, ScanReport};

#[cfg(test)]
pub(crate) mod tests {
    //! Synthetic artifact trees shared by the module tests

    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use tierbench_core::layout::write_json_atomic;
    use tierbench_core::{
        AgentResult, ArtifactLayout, Grade, JudgeError, JudgeExecutor, JudgeRequest, JudgeResult,
        JudgeVerdict, RateLimitInfo, RawAgentOutput, RunResult, TiePolicy, TokenStats, UnitDir,
        UnitKey,
    };

    pub(crate) fn fixture_unit(root: &Path) -> (ArtifactLayout, UnitKey) {
        (ArtifactLayout::new(root), UnitKey::new("T1", "s03", 2))
    }

    pub(crate) fn write_agent_raw(unit: &UnitDir, exit_code: i32, input: u64, cache_read: u64) {
        let raw = RawAgentOutput {
            exit_code,
            usage: TokenStats::new(input, 400, cache_read, 0),
            cost_usd: 0.25,
            duration_seconds: 12.0,
            finished_at: Utc::now(),
        };
        write_json_atomic(&unit.agent_output(), &raw).unwrap();
    }

    pub(crate) fn write_agent_result(
        unit: &UnitDir,
        exit_code: i32,
        input: u64,
        cache_read: u64,
        throttled: bool,
    ) {
        let agent = AgentResult {
            exit_code,
            stdout_path: "agent/stdout.log".into(),
            stderr_path: "agent/stderr.log".into(),
            token_stats: TokenStats::new(input, 400, cache_read, 0),
            duration_seconds: 12.0,
            cost_usd: 0.25,
            rate_limit_info: throttled.then(|| RateLimitInfo {
                source: "agent".into(),
                retry_after_seconds: Some(60.0),
                message: "429".into(),
                detected_at: Utc::now(),
            }),
        };
        write_json_atomic(&unit.agent_result(), &agent).unwrap();
    }

    pub(crate) fn write_judge(unit: &UnitDir, n: u32, score: f64, passed: bool, fallback: bool) {
        let result = JudgeResult {
            judge_model: format!("judge-model-{}", n),
            judge_number: n,
            score,
            passed,
            grade: Grade::from_score(score),
            reasoning: String::new(),
            fallback,
            fallback_reason: fallback.then(|| "judge timed out".to_string()),
            duration_seconds: 1.0,
        };
        write_json_atomic(&unit.judge_result(n), &result).unwrap();
    }

    pub(crate) fn write_run_result(unit: &UnitDir, key: &UnitKey) {
        let agent: AgentResult = tierbench_core::layout::read_json(&unit.agent_result()).unwrap();
        let judges: Vec<JudgeResult> = (1..)
            .map(|n| unit.judge_result(n))
            .take_while(|p| p.exists())
            .map(|p| tierbench_core::layout::read_json(&p).unwrap())
            .collect();
        let run = RunResult::assemble(key.clone(), agent, judges, TiePolicy::NotPassed).unwrap();
        write_json_atomic(&unit.run_result(), &run).unwrap();
    }

    pub(crate) fn complete_unit(layout: &ArtifactLayout, key: &UnitKey, judge_count: u32) {
        let unit = layout.unit_dir(key);
        write_agent_raw(&unit, 0, 10, 20);
        write_agent_result(&unit, 0, 10, 20, false);
        for n in 1..=judge_count {
            write_judge(&unit, n, 0.8, true, false);
        }
        write_run_result(&unit, key);
    }

    pub(crate) struct MockJudge {
        calls: AtomicUsize,
        score: f64,
        saw_no_workspace: AtomicBool,
    }

    impl MockJudge {
        pub(crate) fn new(score: f64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                score,
                saw_no_workspace: AtomicBool::new(false),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn saw_workspace_none(&self) -> bool {
            self.saw_no_workspace.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JudgeExecutor for MockJudge {
        fn name(&self) -> &str {
            "mock"
        }

        async fn judge(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.workspace.is_none() {
                self.saw_no_workspace.store(true, Ordering::SeqCst);
            }
            if request.task_prompt.is_empty() {
                return Err(JudgeError::Timeout(Duration::from_secs(1)));
            }
            Ok(JudgeVerdict {
                score: self.score,
                passed: self.score >= 0.5,
                grade: None,
                reasoning: format!("{} looked at it", request.model),
            })
        }
    }
}
