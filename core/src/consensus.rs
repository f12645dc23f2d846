//! Judge consensus: letter grades, the consensus fold, and the judge panel
//!
//! A unit is scored by N judge slots. Each slot either produces a verdict
//! from the judge backend or, when the backend fails, a deterministic
//! heuristic verdict tagged as a fallback. A throttled judge writes nothing;
//! the unit backs off and runs again. The consensus is the mean of
//! valid scores, a strict majority of valid pass votes, and the grade
//! bucket of the mean.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{ErrorKind, EvalError};
use crate::layout::{write_json_atomic, UnitDir};
use crate::result::{JudgeResult, PhaseTiming, RateLimitInfo};
use crate::traits::{JudgeError, JudgeExecutor, JudgeRequest, JudgeVerdict};
use crate::worker::CallGate;

/// Tolerance for float noise at bucket boundaries (mean of 0.9/0.8/0.7 is
/// 0.8000000000000002, and 0.7999999999999999 must not drop to B)
const GRADE_EPSILON: f64 = 1e-9;

// ============================================================================
// Grade
// ============================================================================

/// Letter grade bucket of a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    /// score >= 0.95
    S,
    /// score >= 0.80
    A,
    /// score >= 0.60
    B,
    /// score >= 0.40
    C,
    /// score >= 0.20
    D,
    /// everything else
    F,
}

impl Grade {
    /// Bucket a score
    pub fn from_score(score: f64) -> Self {
        if !score.is_finite() {
            return Grade::F;
        }
        let s = score + GRADE_EPSILON;
        if s >= 0.95 {
            Grade::S
        } else if s >= 0.80 {
            Grade::A
        } else if s >= 0.60 {
            Grade::B
        } else if s >= 0.40 {
            Grade::C
        } else if s >= 0.20 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = match self {
            Grade::S => "S",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(letter)
    }
}

// ============================================================================
// Consensus
// ============================================================================

/// How an exact split of pass votes is decided
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// A tie does not pass
    #[default]
    NotPassed,
    /// A tie passes
    Passed,
}

/// Folded verdict of all judge slots of a unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Consensus {
    /// No valid judge result; distinct from a 0.0 score
    Undefined,
    /// At least one valid judge result
    Decided {
        /// Mean of valid scores
        score: f64,
        /// Strict majority of valid pass votes
        passed: bool,
        /// Bucket of the mean score
        grade: Grade,
    },
}

impl Consensus {
    /// Mean score, if defined
    pub fn score(&self) -> Option<f64> {
        match self {
            Consensus::Decided { score, .. } => Some(*score),
            Consensus::Undefined => None,
        }
    }

    /// Pass verdict, if defined
    pub fn passed(&self) -> Option<bool> {
        match self {
            Consensus::Decided { passed, .. } => Some(*passed),
            Consensus::Undefined => None,
        }
    }

    /// Grade, if defined
    pub fn grade(&self) -> Option<Grade> {
        match self {
            Consensus::Decided { grade, .. } => Some(*grade),
            Consensus::Undefined => None,
        }
    }

    /// Whether no valid judge contributed
    pub fn is_undefined(&self) -> bool {
        matches!(self, Consensus::Undefined)
    }
}

/// Fold judge results into one verdict
///
/// Invalid scores (non-finite or outside [0, 1]) are ignored. Fallback
/// results are valid and count like any other slot.
pub fn consensus(results: &[JudgeResult], tie_policy: TiePolicy) -> Consensus {
    let valid: Vec<&JudgeResult> = results.iter().filter(|r| r.is_valid()).collect();
    if valid.is_empty() {
        return Consensus::Undefined;
    }

    let n = valid.len();
    let score = valid.iter().map(|r| r.score).sum::<f64>() / n as f64;
    let votes = valid.iter().filter(|r| r.passed).count();
    let passed = match (votes * 2).cmp(&n) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => tie_policy == TiePolicy::Passed,
    };

    Consensus::Decided {
        score,
        passed,
        grade: Grade::from_score(score),
    }
}

/// Deterministic stand-in for a judge that failed
///
/// A clean exit with non-empty output earns a passing B; anything else
/// is an F.
pub fn heuristic_fallback(request: &JudgeRequest, reason: impl Into<String>) -> JudgeResult {
    let produced_output = !request.agent_output.trim().is_empty();
    let (score, passed, reasoning) = if request.agent_exit_code == 0 && produced_output {
        (0.6, true, "heuristic: agent exited cleanly with output")
    } else if request.agent_exit_code == 0 {
        (0.0, false, "heuristic: agent produced no output")
    } else {
        (0.0, false, "heuristic: agent exited with an error")
    };

    JudgeResult {
        judge_model: request.model.clone(),
        judge_number: request.judge_number,
        score,
        passed,
        grade: Grade::from_score(score),
        reasoning: reasoning.to_string(),
        fallback: true,
        fallback_reason: Some(reason.into()),
        duration_seconds: 0.0,
    }
}

// ============================================================================
// Judge Panel
// ============================================================================

/// Raw record of one judge call (`judge/judge_NN/judgment.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    /// Judge model
    pub judge_model: String,
    /// 1-based slot
    pub judge_number: u32,
    /// Backend verdict, absent when the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<JudgeVerdict>,
    /// Backend failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the call returned
    pub recorded_at: DateTime<Utc>,
}

/// Why a judge slot produced nothing
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    /// The judge provider throttled the call; the slot was not written
    #[error("{0}")]
    RateLimited(RateLimitInfo),

    /// A slot artifact could not be written
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl From<PanelError> for EvalError {
    fn from(err: PanelError) -> Self {
        match err {
            PanelError::RateLimited(info) => EvalError::new(ErrorKind::RateLimited, info.to_string()),
            PanelError::Eval(e) => e,
        }
    }
}

/// Runs every configured judge slot for a unit and persists each slot
pub struct JudgePanel {
    backend: Arc<dyn JudgeExecutor>,
    gate: CallGate,
    tie_policy: TiePolicy,
}

impl JudgePanel {
    /// Panel over a judge backend with no call limits
    pub fn new(backend: Arc<dyn JudgeExecutor>) -> Self {
        Self {
            backend,
            gate: CallGate::unlimited(),
            tie_policy: TiePolicy::default(),
        }
    }

    /// Route judge calls through a shared gate
    pub fn with_gate(mut self, gate: CallGate) -> Self {
        self.gate = gate;
        self
    }

    /// Set the tie policy
    pub fn with_tie_policy(mut self, tie_policy: TiePolicy) -> Self {
        self.tie_policy = tie_policy;
        self
    }

    /// Tie policy used for consensus
    pub fn tie_policy(&self) -> TiePolicy {
        self.tie_policy
    }

    /// Judge one agent result with every model in `models`
    ///
    /// `context` carries the prompt, agent output, and workspace; its model
    /// and slot number are replaced per slot. Judge failures become
    /// heuristic fallbacks. A throttled judge stops the panel with
    /// [`PanelError::RateLimited`] so the unit can back off and run again.
    pub async fn evaluate(
        &self,
        unit_dir: &UnitDir,
        models: &[String],
        context: &JudgeRequest,
    ) -> Result<Vec<JudgeResult>, PanelError> {
        let mut results = Vec::with_capacity(models.len());
        for (idx, model) in models.iter().enumerate() {
            let request = JudgeRequest {
                model: model.clone(),
                judge_number: idx as u32 + 1,
                ..context.clone()
            };
            results.push(self.run_slot(unit_dir, request).await?);
        }
        Ok(results)
    }

    /// Run and persist a single judge slot
    ///
    /// Nothing is written when the judge is throttled.
    pub async fn run_slot(&self, unit_dir: &UnitDir, request: JudgeRequest) -> Result<JudgeResult, PanelError> {
        let started_at = Utc::now();
        let outcome = match self.gate.acquire().await {
            Ok(_permit) => self.call_backend(&request).await,
            Err(e) => Err(JudgeError::Backend(e.to_string())),
        };
        let n = request.judge_number;
        if let Err(JudgeError::RateLimited(info)) = outcome {
            tracing::warn!(
                judge = n,
                model = %request.model,
                retry_after_secs = ?info.retry_after_seconds,
                "Judge rate limited, slot left unwritten"
            );
            return Err(PanelError::RateLimited(info));
        }
        let timing_error = outcome.as_ref().err().map(|e| e.to_string());
        let timing = PhaseTiming::finish(started_at, timing_error);

        let (judgment, mut result) = match outcome {
            Ok(verdict) => {
                let result = JudgeResult {
                    judge_model: request.model.clone(),
                    judge_number: n,
                    score: verdict.score,
                    passed: verdict.passed,
                    grade: verdict.grade.unwrap_or_else(|| Grade::from_score(verdict.score)),
                    reasoning: verdict.reasoning.clone(),
                    fallback: false,
                    fallback_reason: None,
                    duration_seconds: 0.0,
                };
                let judgment = Judgment {
                    judge_model: request.model.clone(),
                    judge_number: n,
                    verdict: Some(verdict),
                    error: None,
                    recorded_at: timing.finished_at,
                };
                (judgment, result)
            }
            Err(e) => {
                tracing::warn!(
                    judge = n,
                    model = %request.model,
                    error = %e,
                    error_kind = %e.to_error_kind(),
                    "Judge failed, using heuristic fallback"
                );
                let judgment = Judgment {
                    judge_model: request.model.clone(),
                    judge_number: n,
                    verdict: None,
                    error: Some(e.to_string()),
                    recorded_at: timing.finished_at,
                };
                (judgment, heuristic_fallback(&request, e.to_string()))
            }
        };
        result.duration_seconds = timing.duration_seconds;

        write_json_atomic(&unit_dir.judgment(n), &judgment)?;
        write_json_atomic(&unit_dir.judge_result(n), &result)?;
        write_json_atomic(&unit_dir.judge_timing(n), &timing)?;

        tracing::debug!(
            judge = n,
            score = result.score,
            passed = result.passed,
            fallback = result.fallback,
            "Judge slot recorded"
        );
        Ok(result)
    }

    async fn call_backend(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
        let verdict = self.backend.judge(request).await?;
        if !verdict.score.is_finite() || !(0.0..=1.0).contains(&verdict.score) {
            return Err(JudgeError::InvalidResponse(format!(
                "score {} outside [0, 1]",
                verdict.score
            )));
        }
        Ok(verdict)
    }
}

impl std::fmt::Debug for JudgePanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgePanel")
            .field("backend", &self.backend.name())
            .field("tie_policy", &self.tie_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::read_json;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn judge(n: u32, score: f64, passed: bool) -> JudgeResult {
        JudgeResult {
            judge_model: format!("model-{}", n),
            judge_number: n,
            score,
            passed,
            grade: Grade::from_score(score),
            reasoning: String::new(),
            fallback: false,
            fallback_reason: None,
            duration_seconds: 1.0,
        }
    }

    fn context(exit_code: i32, output: &str) -> JudgeRequest {
        JudgeRequest {
            model: String::new(),
            judge_number: 0,
            task_prompt: "Fix the bug".into(),
            agent_output: output.into(),
            agent_exit_code: exit_code,
            workspace: None,
        }
    }

    #[test]
    fn test_grade_buckets() {
        assert_eq!(Grade::from_score(1.0), Grade::S);
        assert_eq!(Grade::from_score(0.95), Grade::S);
        assert_eq!(Grade::from_score(0.94), Grade::A);
        assert_eq!(Grade::from_score(0.80), Grade::A);
        assert_eq!(Grade::from_score(0.6), Grade::B);
        assert_eq!(Grade::from_score(0.59), Grade::C);
        assert_eq!(Grade::from_score(0.4), Grade::C);
        assert_eq!(Grade::from_score(0.2), Grade::D);
        assert_eq!(Grade::from_score(0.19), Grade::F);
        assert_eq!(Grade::from_score(0.0), Grade::F);
        assert_eq!(Grade::from_score(f64::NAN), Grade::F);
    }

    #[test]
    fn test_grade_serializes_as_letter() {
        assert_eq!(serde_json::to_string(&Grade::A).unwrap(), "\"A\"");
        let back: Grade = serde_json::from_str("\"S\"").unwrap();
        assert_eq!(back, Grade::S);
    }

    #[test]
    fn test_consensus_mean_majority_grade() {
        let results = vec![judge(1, 0.9, true), judge(2, 0.8, true), judge(3, 0.7, true)];
        let c = consensus(&results, TiePolicy::NotPassed);
        assert!((c.score().unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(c.passed(), Some(true));
        assert_eq!(c.grade(), Some(Grade::A));
    }

    #[test]
    fn test_consensus_minority_pass_fails() {
        let results = vec![judge(1, 0.9, true), judge(2, 0.3, false), judge(3, 0.2, false)];
        assert_eq!(consensus(&results, TiePolicy::NotPassed).passed(), Some(false));
        assert_eq!(consensus(&results, TiePolicy::Passed).passed(), Some(false));
    }

    #[test]
    fn test_consensus_tie_policy() {
        let results = vec![judge(1, 0.9, true), judge(2, 0.3, false)];
        assert_eq!(consensus(&results, TiePolicy::NotPassed).passed(), Some(false));
        assert_eq!(consensus(&results, TiePolicy::Passed).passed(), Some(true));
    }

    #[test]
    fn test_consensus_zero_valid_is_undefined() {
        assert!(consensus(&[], TiePolicy::NotPassed).is_undefined());

        let invalid = vec![judge(1, f64::NAN, true), judge(2, 1.7, true)];
        let c = consensus(&invalid, TiePolicy::NotPassed);
        assert_eq!(c, Consensus::Undefined);
        assert_eq!(c.score(), None);
        assert_eq!(serde_json::to_string(&c).unwrap(), r#"{"state":"undefined"}"#);
    }

    #[test]
    fn test_consensus_ignores_invalid_scores() {
        let results = vec![judge(1, 0.5, true), judge(2, -1.0, false)];
        let c = consensus(&results, TiePolicy::NotPassed);
        assert_eq!(c.score(), Some(0.5));
        assert_eq!(c.passed(), Some(true));
    }

    #[test]
    fn test_consensus_serialization() {
        let c = Consensus::Decided {
            score: 0.5,
            passed: false,
            grade: Grade::C,
        };
        let json = serde_json::to_value(c).unwrap();
        assert_eq!(json["state"], "decided");
        assert_eq!(json["grade"], "C");
        let back: Consensus = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_heuristic_fallback() {
        let mut request = context(0, "patched src/lib.rs");
        request.model = "judge-a".into();
        request.judge_number = 2;
        let ok = heuristic_fallback(&request, "timeout");
        assert!(ok.fallback);
        assert!(ok.passed);
        assert_eq!(ok.grade, Grade::B);
        assert_eq!(ok.judge_number, 2);
        assert_eq!(ok.fallback_reason.as_deref(), Some("timeout"));

        let empty = heuristic_fallback(&context(0, "  \n"), "x");
        assert!(!empty.passed);
        assert_eq!(empty.grade, Grade::F);

        let crashed = heuristic_fallback(&context(1, "partial"), "x");
        assert_eq!(crashed.score, 0.0);
    }

    struct ScriptedJudge {
        calls: AtomicUsize,
        fail_slot: Option<u32>,
    }

    #[async_trait]
    impl JudgeExecutor for ScriptedJudge {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn judge(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if Some(request.judge_number) == self.fail_slot {
                return Err(JudgeError::Backend("judge unavailable".into()));
            }
            Ok(JudgeVerdict {
                score: 0.9,
                passed: true,
                grade: None,
                reasoning: format!("looks good to {}", request.model),
            })
        }
    }

    #[tokio::test]
    async fn test_panel_persists_every_slot_including_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = UnitDir::new(dir.path());
        let backend = Arc::new(ScriptedJudge {
            calls: AtomicUsize::new(0),
            fail_slot: Some(2),
        });
        let panel = JudgePanel::new(backend.clone());
        let models = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let results = panel
            .evaluate(&unit_dir, &models, &context(0, "done"))
            .await
            .unwrap();

        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(results.len(), 3);
        assert!(!results[0].fallback);
        assert!(results[1].fallback);
        assert_eq!(results[1].judge_model, "b");
        assert_eq!(results[2].grade, Grade::A);

        for n in 1..=3 {
            assert!(unit_dir.judge_result(n).exists());
            assert!(unit_dir.judge_timing(n).exists());
        }
        let judgment: Judgment = read_json(&unit_dir.judgment(2)).unwrap();
        assert!(judgment.verdict.is_none());
        assert!(judgment.error.unwrap().contains("unavailable"));

        let persisted: JudgeResult = read_json(&unit_dir.judge_result(2)).unwrap();
        assert_eq!(persisted, results[1]);
    }

    struct OutOfRangeJudge;

    #[async_trait]
    impl JudgeExecutor for OutOfRangeJudge {
        fn name(&self) -> &str {
            "out-of-range"
        }

        async fn judge(&self, _request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
            Ok(JudgeVerdict {
                score: 7.0,
                passed: true,
                grade: None,
                reasoning: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_panel_out_of_range_score_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = UnitDir::new(dir.path());
        let panel = JudgePanel::new(Arc::new(OutOfRangeJudge));
        let result = panel
            .run_slot(
                &unit_dir,
                JudgeRequest {
                    model: "m".into(),
                    judge_number: 1,
                    ..context(1, "")
                },
            )
            .await
            .unwrap();
        assert!(result.fallback);
        assert!(result.is_valid());
        assert!(!result.passed);
    }

    struct ThrottledJudge {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JudgeExecutor for ThrottledJudge {
        fn name(&self) -> &str {
            "throttled"
        }

        async fn judge(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if request.judge_number == 1 {
                return Ok(JudgeVerdict {
                    score: 0.9,
                    passed: true,
                    grade: None,
                    reasoning: String::new(),
                });
            }
            Err(JudgeError::RateLimited(RateLimitInfo {
                source: "judge".into(),
                retry_after_seconds: Some(30.0),
                message: "429 Too Many Requests".into(),
                detected_at: Utc::now(),
            }))
        }
    }

    #[tokio::test]
    async fn test_panel_throttled_judge_is_not_a_fallback_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = UnitDir::new(dir.path());
        let backend = Arc::new(ThrottledJudge {
            calls: AtomicUsize::new(0),
        });
        let panel = JudgePanel::new(backend.clone());
        let models = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let err = panel
            .evaluate(&unit_dir, &models, &context(0, "done"))
            .await
            .unwrap_err();

        match err {
            PanelError::RateLimited(info) => assert_eq!(info.retry_after_seconds, Some(30.0)),
            other => panic!("expected rate limit, got {:?}", other),
        }
        // The panel stops at the throttled slot
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 2);
        assert!(unit_dir.judge_result(1).exists());
        assert!(!unit_dir.judge_result(2).exists());
        assert!(!unit_dir.judgment(2).exists());
        assert!(!unit_dir.judge_timing(2).exists());
        assert!(!unit_dir.judge_result(3).exists());
    }

    #[test]
    fn test_panel_rate_limit_converts_to_rate_limited_kind() {
        let err: EvalError = PanelError::RateLimited(RateLimitInfo {
            source: "judge".into(),
            retry_after_seconds: None,
            message: "overloaded".into(),
            detected_at: Utc::now(),
        })
        .into();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.message.contains("overloaded"));
    }
}
