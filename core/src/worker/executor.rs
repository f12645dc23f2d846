//! Safe execution of one unit: agent -> artifacts -> judges -> run result

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::consensus::{JudgePanel, PanelError};
use crate::error::{ErrorKind, EvalError};
use crate::layout::{
    ensure_dir, write_json_atomic, write_text_atomic, ArtifactLayout, UnitDir,
};
use crate::rate_limit::detect_rate_limit;
use crate::result::{AgentResult, PhaseTiming, RateLimitInfo, RawAgentOutput, RunResult};
use crate::task::TaskUnit;
use crate::traits::{AgentError, AgentExecutor, JudgeRequest};

use super::call_gate::CallGate;
use super::outcome::{UnitOutcome, WorkerResult};

/// Why a unit stopped short, before classification into an outcome
enum UnitFailure {
    RateLimited(RateLimitInfo),
    Substrate(String),
    Local(EvalError),
}

impl From<EvalError> for UnitFailure {
    fn from(err: EvalError) -> Self {
        UnitFailure::Local(err)
    }
}

impl From<PanelError> for UnitFailure {
    fn from(err: PanelError) -> Self {
        match err {
            PanelError::RateLimited(info) => UnitFailure::RateLimited(info),
            PanelError::Eval(e) => UnitFailure::Local(e),
        }
    }
}

impl From<AgentError> for UnitFailure {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::RateLimited(info) => UnitFailure::RateLimited(info),
            AgentError::Substrate(msg) => UnitFailure::Substrate(msg),
            other => UnitFailure::Local(EvalError::new(other.to_error_kind(), other.to_string())),
        }
    }
}

/// Runs a unit end to end without ever failing or unwinding
///
/// Workers share one `SafeWorker` via `Arc`; it holds no per-unit state.
pub struct SafeWorker {
    agent: Arc<dyn AgentExecutor>,
    panel: Arc<JudgePanel>,
    layout: ArtifactLayout,
    gate: CallGate,
}

impl SafeWorker {
    /// Create a worker
    ///
    /// Use `WorkerBuilder` for a more ergonomic construction.
    pub fn new(
        agent: Arc<dyn AgentExecutor>,
        panel: Arc<JudgePanel>,
        layout: ArtifactLayout,
        gate: CallGate,
    ) -> Self {
        Self {
            agent,
            panel,
            layout,
            gate,
        }
    }

    /// Artifact layout this worker writes into
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Run one unit
    ///
    /// Errors and panics inside the unit are caught, logged with the unit
    /// key, and classified. On failure a partial `agent/timing.json` is
    /// left behind when the agent phase never finished.
    pub async fn run(&self, unit: &TaskUnit) -> WorkerResult {
        let started_at = Utc::now();
        tracing::debug!(unit = %unit.key, "Unit started");

        let outcome = match AssertUnwindSafe(self.execute(unit)).catch_unwind().await {
            Ok(Ok(run)) => {
                tracing::debug!(
                    unit = %unit.key,
                    score = ?run.consensus.score(),
                    passed = ?run.consensus.passed(),
                    "Unit complete"
                );
                UnitOutcome::Success(Box::new(run))
            }
            Ok(Err(UnitFailure::RateLimited(info))) => {
                tracing::warn!(
                    unit = %unit.key,
                    retry_after_secs = ?info.retry_after_seconds,
                    source = %info.source,
                    "Unit rate limited"
                );
                UnitOutcome::RateLimited(info)
            }
            Ok(Err(UnitFailure::Substrate(error))) => {
                tracing::warn!(
                    unit = %unit.key,
                    error = %error,
                    error_kind = %ErrorKind::PoolBroken,
                    "Execution substrate failed"
                );
                UnitOutcome::PoolFailure { error }
            }
            Ok(Err(UnitFailure::Local(e))) => {
                tracing::warn!(
                    unit = %unit.key,
                    error = %e.message,
                    error_kind = %e.kind,
                    "Unit failed"
                );
                UnitOutcome::WorkerFailure {
                    error: e.to_string(),
                }
            }
            Err(panic) => {
                let error = format!("worker panicked: {}", panic_message(panic.as_ref()));
                tracing::warn!(
                    unit = %unit.key,
                    error = %error,
                    error_kind = %ErrorKind::Unknown,
                    "Unit panicked"
                );
                UnitOutcome::WorkerFailure { error }
            }
        };

        if let Some(error) = outcome.error() {
            self.write_partial_timing(&self.layout.unit_dir(&unit.key), started_at, error);
        }

        WorkerResult {
            key: unit.key.clone(),
            outcome,
        }
    }

    async fn execute(&self, unit: &TaskUnit) -> Result<RunResult, UnitFailure> {
        let unit_dir = self.layout.unit_dir(&unit.key);
        write_text_atomic(&unit_dir.task_prompt(), &unit.task_prompt)?;
        let workspace = unit_dir.workspace();
        ensure_dir(&workspace)?;

        // 1. Agent
        let agent_started = Utc::now();
        let output = {
            let _permit = self.gate.acquire().await?;
            self.agent.execute(unit, &workspace).await?
        };

        // 2. Raw agent artifacts
        write_text_atomic(&unit_dir.agent_stdout(), &output.stdout)?;
        write_text_atomic(&unit_dir.agent_stderr(), &output.stderr)?;
        let raw = RawAgentOutput::from_output(&output);
        write_json_atomic(&unit_dir.agent_output(), &raw)?;

        // Some agent CLIs print a limit banner on stderr and still exit 0.
        // Stdout is the agent's work, so it only counts on a failed exit.
        let rate_limit = detect_rate_limit(&output.stderr, "agent").or_else(|| {
            (output.exit_code != 0)
                .then(|| detect_rate_limit(&output.stdout, "agent"))
                .flatten()
        });

        // 3. Derived agent summary
        let agent = AgentResult::from_raw(
            &raw,
            unit_dir.relative(&unit_dir.agent_stdout()).to_path_buf(),
            unit_dir.relative(&unit_dir.agent_stderr()).to_path_buf(),
            rate_limit.clone(),
        );
        write_json_atomic(&unit_dir.agent_result(), &agent)?;
        let timing_error = rate_limit.as_ref().map(|info| info.to_string());
        write_json_atomic(
            &unit_dir.agent_timing(),
            &PhaseTiming::finish(agent_started, timing_error),
        )?;

        if let Some(info) = rate_limit {
            return Err(UnitFailure::RateLimited(info));
        }

        // 4. Judges
        let context = JudgeRequest {
            model: String::new(),
            judge_number: 0,
            task_prompt: unit.task_prompt.to_string(),
            agent_output: output.stdout,
            agent_exit_code: output.exit_code,
            workspace: workspace.is_dir().then_some(workspace),
        };
        let judges = self
            .panel
            .evaluate(&unit_dir, &unit.judge_models, &context)
            .await?;

        // 5. Consolidated result
        let run = RunResult::assemble(unit.key.clone(), agent, judges, self.panel.tie_policy())
            .ok_or_else(|| EvalError::integrity(format!("{} has no judge slots", unit.key)))?;
        write_json_atomic(&unit_dir.run_result(), &run)?;
        Ok(run)
    }

    fn write_partial_timing(&self, unit_dir: &UnitDir, started_at: DateTime<Utc>, error: String) {
        if unit_dir.agent_result().exists() {
            return;
        }
        let timing = PhaseTiming::finish(started_at, Some(error));
        if let Err(e) = write_json_atomic(&unit_dir.agent_timing(), &timing) {
            tracing::debug!(error = %e, "Could not write partial timing");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl std::fmt::Debug for SafeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeWorker")
            .field("agent", &self.agent.name())
            .field("panel", &self.panel)
            .field("layout", &self.layout)
            .finish()
    }
}
