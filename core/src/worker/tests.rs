//! Integration tests for the worker module
//!
//! The mocks here are shared with the scheduler and runner tests.

use super::*;
use crate::layout::{read_json, ArtifactLayout};
use crate::result::{AgentOutput, AgentResult, PhaseTiming, RateLimitInfo, RunResult, TokenStats};
use crate::task::{TaskUnit, UnitKey};
use crate::traits::{
    AgentError, AgentExecutor, JudgeError, JudgeExecutor, JudgeRequest, JudgeVerdict,
};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock AgentExecutor
// ============================================================================

/// What the mock agent does for one call
#[derive(Debug, Clone, Copy)]
pub(crate) enum Script {
    Succeed,
    Crash,
    Panic,
    Substrate,
    RateLimited(f64),
    ThrottledExit,
    LimitBannerCleanExit,
    LimitTopicCleanExit,
}

pub(crate) struct MockAgent {
    calls: AtomicUsize,
    delay: Option<Duration>,
    always: HashMap<u32, Script>,
    once: Mutex<HashMap<u32, VecDeque<Script>>>,
    per_unit: Mutex<HashMap<UnitKey, usize>>,
    probe: Option<&'static str>,
}

impl MockAgent {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: None,
            always: HashMap::new(),
            once: Mutex::new(HashMap::new()),
            per_unit: Mutex::new(HashMap::new()),
            probe: None,
        }
    }

    /// Answer pre-flight probes with `text`
    pub(crate) fn with_probe(mut self, text: &'static str) -> Self {
        self.probe = Some(text);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every call for `run` follows `script`
    pub(crate) fn always(mut self, run: u32, script: Script) -> Self {
        self.always.insert(run, script);
        self
    }

    /// The next call for `run` follows `script`, later calls fall through
    pub(crate) fn once(self, run: u32, script: Script) -> Self {
        self.once
            .lock()
            .unwrap()
            .entry(run)
            .or_default()
            .push_back(script);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, key: &UnitKey) -> usize {
        self.per_unit.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn next_script(&self, run: u32) -> Script {
        if let Some(script) = self
            .once
            .lock()
            .unwrap()
            .get_mut(&run)
            .and_then(|queue| queue.pop_front())
        {
            return script;
        }
        self.always.get(&run).copied().unwrap_or(Script::Succeed)
    }
}

pub(crate) fn rate_limit_info(secs: f64) -> RateLimitInfo {
    RateLimitInfo {
        source: "agent".into(),
        retry_after_seconds: Some(secs),
        message: "429 Too Many Requests".into(),
        detected_at: chrono::Utc::now(),
    }
}

#[async_trait]
impl AgentExecutor for MockAgent {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, unit: &TaskUnit, workspace: &Path) -> Result<AgentOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_unit
            .lock()
            .unwrap()
            .entry(unit.key.clone())
            .or_insert(0) += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_script(unit.run_number()) {
            Script::Succeed => Ok(AgentOutput {
                exit_code: 0,
                stdout: format!("solved {} in {}", unit.key, workspace.display()),
                stderr: String::new(),
                token_stats: TokenStats::new(100, 50, 1_000, 10),
                cost_usd: 0.01,
                duration: Duration::from_millis(1_500),
            }),
            Script::Crash => Err(AgentError::Crashed(format!("segfault in {}", unit.key))),
            Script::Panic => panic!("agent blew up on {}", unit.key),
            Script::Substrate => Err(AgentError::Substrate("worker runtime lost".into())),
            Script::RateLimited(secs) => Err(AgentError::RateLimited(rate_limit_info(secs))),
            Script::ThrottledExit => Ok(AgentOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "API Error: 429 Too Many Requests. retry after 30 seconds".into(),
                token_stats: TokenStats::default(),
                cost_usd: 0.0,
                duration: Duration::from_millis(200),
            }),
            Script::LimitTopicCleanExit => Ok(AgentOutput {
                exit_code: 0,
                stdout: "Added rate limit middleware that answers 429 Too Many Requests".into(),
                stderr: String::new(),
                token_stats: TokenStats::new(100, 50, 0, 0),
                cost_usd: 0.01,
                duration: Duration::from_millis(900),
            }),
            Script::LimitBannerCleanExit => Ok(AgentOutput {
                exit_code: 0,
                stdout: "Working on it...".into(),
                stderr: "You've hit your limit. Try again in 5 minutes".into(),
                token_stats: TokenStats::default(),
                cost_usd: 0.0,
                duration: Duration::from_millis(200),
            }),
        }
    }

    async fn probe(&self) -> Result<String, AgentError> {
        Ok(self.probe.unwrap_or("pong").to_string())
    }
}

// ============================================================================
// Mock JudgeExecutor
// ============================================================================

pub(crate) struct MockJudge {
    calls: AtomicUsize,
    score: f64,
    fail_slot: Option<u32>,
    throttled_calls: AtomicUsize,
}

impl MockJudge {
    pub(crate) fn new(score: f64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            score,
            fail_slot: None,
            throttled_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_fail_slot(mut self, slot: u32) -> Self {
        self.fail_slot = Some(slot);
        self
    }

    /// The first `n` calls are throttled with a 30s retry-after
    pub(crate) fn with_throttled_calls(self, n: usize) -> Self {
        self.throttled_calls.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgeExecutor for MockJudge {
    fn name(&self) -> &str {
        "mock"
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let throttled = self
            .throttled_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            let mut info = rate_limit_info(30.0);
            info.source = "judge".into();
            return Err(JudgeError::RateLimited(info));
        }
        if Some(request.judge_number) == self.fail_slot {
            return Err(JudgeError::Timeout(Duration::from_secs(120)));
        }
        Ok(JudgeVerdict {
            score: self.score,
            passed: self.score >= 0.5,
            grade: None,
            reasoning: format!("{} reviewed the diff", request.model),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn judges(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("judge-model-{}", i)).collect()
}

pub(crate) fn units(tier: &str, count: u32, judge_count: usize) -> Vec<TaskUnit> {
    (1..=count)
        .map(|run| {
            TaskUnit::new(
                UnitKey::new(tier, "s01", run),
                "Make the failing test pass",
                judges(judge_count),
            )
        })
        .collect()
}

pub(crate) fn build_worker(
    agent: Arc<MockAgent>,
    judge: Arc<MockJudge>,
    root: &Path,
) -> SafeWorker {
    WorkerBuilder::new()
        .agent(agent)
        .judge(judge)
        .layout(ArtifactLayout::new(root))
        .build()
        .unwrap()
}

// ============================================================================
// SafeWorker
// ============================================================================

#[tokio::test]
async fn test_success_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new());
    let judge = Arc::new(MockJudge::new(0.8));
    let worker = build_worker(agent.clone(), judge.clone(), dir.path());
    let unit = &units("T0", 1, 3)[0];

    let result = worker.run(unit).await;
    let UnitOutcome::Success(run) = result.outcome else {
        panic!("expected success, got {:?}", result.outcome);
    };

    assert_eq!(result.key, unit.key);
    assert_eq!(judge.calls(), 3);
    assert_eq!(run.tokens_input, 1_100);
    assert_eq!(run.consensus.passed(), Some(true));

    let unit_dir = worker.layout().unit_dir(&unit.key);
    assert!(unit_dir.task_prompt().exists());
    assert!(unit_dir.workspace().is_dir());
    assert!(unit_dir.agent_stdout().exists());
    assert!(unit_dir.agent_output().exists());
    for n in 1..=3 {
        assert!(unit_dir.judgment(n).exists());
        assert!(unit_dir.judge_result(n).exists());
    }

    let agent_result: AgentResult = read_json(&unit_dir.agent_result()).unwrap();
    assert_eq!(agent_result.stdout_path, Path::new("agent/stdout.log"));
    let persisted: RunResult = read_json(&unit_dir.run_result()).unwrap();
    assert_eq!(persisted, *run);
}

#[tokio::test]
async fn test_agent_error_becomes_worker_failure() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().always(1, Script::Crash));
    let judge = Arc::new(MockJudge::new(0.8));
    let worker = build_worker(agent, judge.clone(), dir.path());
    let unit = &units("T0", 1, 1)[0];

    let result = worker.run(unit).await;
    match &result.outcome {
        UnitOutcome::WorkerFailure { error } => assert!(error.contains("segfault")),
        other => panic!("expected worker failure, got {:?}", other),
    }
    assert_eq!(judge.calls(), 0);

    let unit_dir = worker.layout().unit_dir(&unit.key);
    assert!(!unit_dir.run_result().exists());
    let timing: PhaseTiming = read_json(&unit_dir.agent_timing()).unwrap();
    assert!(timing.error.unwrap().contains("segfault"));
}

#[tokio::test]
async fn test_panic_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().always(1, Script::Panic));
    let worker = build_worker(agent, Arc::new(MockJudge::new(0.8)), dir.path());
    let unit = &units("T0", 1, 1)[0];

    let result = worker.run(unit).await;
    match result.outcome {
        UnitOutcome::WorkerFailure { error } => {
            assert!(error.contains("panicked"));
            assert!(error.contains("blew up"));
        }
        other => panic!("expected worker failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_substrate_error_becomes_pool_failure() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().always(1, Script::Substrate));
    let worker = build_worker(agent, Arc::new(MockJudge::new(0.8)), dir.path());

    let result = worker.run(&units("T0", 1, 1)[0]).await;
    assert!(matches!(result.outcome, UnitOutcome::PoolFailure { .. }));
    assert_eq!(result.outcome.label(), "pool_failure");
}

#[tokio::test]
async fn test_structured_rate_limit() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().always(1, Script::RateLimited(45.0)));
    let worker = build_worker(agent, Arc::new(MockJudge::new(0.8)), dir.path());

    let result = worker.run(&units("T0", 1, 1)[0]).await;
    match result.outcome {
        UnitOutcome::RateLimited(info) => assert_eq!(info.retry_after_seconds, Some(45.0)),
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_throttled_exit_is_detected_and_not_judged() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().always(1, Script::ThrottledExit));
    let judge = Arc::new(MockJudge::new(0.8));
    let worker = build_worker(agent, judge.clone(), dir.path());
    let unit = &units("T0", 1, 2)[0];

    let result = worker.run(unit).await;
    match result.outcome {
        UnitOutcome::RateLimited(info) => assert_eq!(info.retry_after_seconds, Some(30.0)),
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert_eq!(judge.calls(), 0);

    let unit_dir = worker.layout().unit_dir(&unit.key);
    let agent_result: AgentResult = read_json(&unit_dir.agent_result()).unwrap();
    assert!(agent_result.rate_limit_info.is_some());
    assert!(!unit_dir.run_result().exists());
}

#[tokio::test]
async fn test_limit_banner_on_clean_exit_is_rate_limited() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().always(1, Script::LimitBannerCleanExit));
    let judge = Arc::new(MockJudge::new(0.8));
    let worker = build_worker(agent, judge.clone(), dir.path());
    let unit = &units("T0", 1, 2)[0];

    let result = worker.run(unit).await;
    match result.outcome {
        UnitOutcome::RateLimited(info) => assert_eq!(info.retry_after_seconds, Some(300.0)),
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert_eq!(judge.calls(), 0);
    assert!(!worker.layout().unit_dir(&unit.key).run_result().exists());
}

#[tokio::test]
async fn test_limit_text_in_clean_stdout_is_judged() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().always(1, Script::LimitTopicCleanExit));
    let judge = Arc::new(MockJudge::new(0.8));
    let worker = build_worker(agent, judge.clone(), dir.path());

    assert!(worker.run(&units("T0", 1, 1)[0]).await.outcome.is_success());
    assert_eq!(judge.calls(), 1);
}

#[tokio::test]
async fn test_throttled_judge_rate_limits_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let judge = Arc::new(MockJudge::new(0.9).with_throttled_calls(1));
    let worker = build_worker(Arc::new(MockAgent::new()), judge.clone(), dir.path());
    let unit = &units("T0", 1, 3)[0];

    let result = worker.run(unit).await;
    match result.outcome {
        UnitOutcome::RateLimited(info) => {
            assert_eq!(info.source, "judge");
            assert_eq!(info.retry_after_seconds, Some(30.0));
        }
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert_eq!(judge.calls(), 1);

    let unit_dir = worker.layout().unit_dir(&unit.key);
    assert!(!unit_dir.judge_result(1).exists());
    assert!(!unit_dir.run_result().exists());

    let UnitOutcome::Success(run) = worker.run(unit).await.outcome else {
        panic!("expected success on resubmission");
    };
    assert!(!run.used_fallback());
    assert_eq!(run.consensus.passed(), Some(true));
}

#[tokio::test]
async fn test_judge_failure_uses_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let judge = Arc::new(MockJudge::new(0.9).with_fail_slot(2));
    let worker = build_worker(Arc::new(MockAgent::new()), judge, dir.path());

    let result = worker.run(&units("T0", 1, 3)[0]).await;
    let UnitOutcome::Success(run) = result.outcome else {
        panic!("expected success");
    };
    assert!(run.used_fallback());
    assert!(run.judges[1].fallback);
    assert_eq!(run.consensus.passed(), Some(true));
}

#[tokio::test]
async fn test_rerun_after_failure_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockAgent::new().once(1, Script::Crash));
    let worker = build_worker(agent.clone(), Arc::new(MockJudge::new(0.8)), dir.path());
    let unit = &units("T0", 1, 1)[0];

    assert!(!worker.run(unit).await.outcome.is_success());
    assert!(worker.run(unit).await.outcome.is_success());
    assert_eq!(agent.calls_for(&unit.key), 2);
}
