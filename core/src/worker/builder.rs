//! Builder pattern for SafeWorker construction

use crate::consensus::{JudgePanel, TiePolicy};
use crate::error::{EvalError, EvalResult};
use crate::layout::ArtifactLayout;
use crate::traits::{AgentExecutor, JudgeExecutor};

use super::call_gate::CallGate;
use super::executor::SafeWorker;

use std::sync::Arc;

/// Builder for creating SafeWorker instances
///
/// # Example
/// ```ignore
/// let worker = WorkerBuilder::new()
///     .agent(agent)
///     .judge(judge)
///     .layout(ArtifactLayout::new("results/exp-1"))
///     .tie_policy(TiePolicy::NotPassed)
///     .gate(CallGate::new(Some(2.0), Some(8)))
///     .build()?;
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    agent: Option<Arc<dyn AgentExecutor>>,
    judge: Option<Arc<dyn JudgeExecutor>>,
    layout: Option<ArtifactLayout>,
    gate: Option<CallGate>,
    tie_policy: TiePolicy,
}

impl WorkerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent backend
    pub fn agent(mut self, agent: Arc<dyn AgentExecutor>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set the judge backend
    pub fn judge(mut self, judge: Arc<dyn JudgeExecutor>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Set the artifact layout
    pub fn layout(mut self, layout: ArtifactLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Set the call gate shared with other workers
    pub fn gate(mut self, gate: CallGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Set the consensus tie policy
    pub fn tie_policy(mut self, tie_policy: TiePolicy) -> Self {
        self.tie_policy = tie_policy;
        self
    }

    /// Build the SafeWorker
    ///
    /// # Errors
    /// Returns an error if the agent, judge, or layout is missing.
    pub fn build(self) -> EvalResult<SafeWorker> {
        let agent = self.agent.ok_or(EvalError::missing_config("agent"))?;
        let judge = self.judge.ok_or(EvalError::missing_config("judge"))?;
        let layout = self.layout.ok_or(EvalError::missing_config("layout"))?;
        let gate = self.gate.unwrap_or_default();

        let panel = JudgePanel::new(judge)
            .with_gate(gate.clone())
            .with_tie_policy(self.tie_policy);

        Ok(SafeWorker::new(agent, Arc::new(panel), layout, gate))
    }
}
