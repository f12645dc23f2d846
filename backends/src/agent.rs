//! Agent backend that runs an external command per unit
//!
//! The task prompt goes to the command's stdin and the unit identity is
//! exported as `TIERBENCH_*` environment variables. The command runs inside
//! the unit workspace when that directory exists. If the last non-empty
//! stdout line is a JSON object, token usage and cost are read from it:
//!
//! ```text
//! {"usage": {"input_tokens": 33, "output_tokens": 812, "cache_read_input_tokens": 195735}, "total_cost_usd": 0.41}
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tierbench_core::{AgentError, AgentExecutor, AgentOutput, CommandConfig, TaskUnit, TokenStats};

use crate::command::{
    last_json_line, run_command, truncate, BackendConfigError, CommandError, CommandSpec,
};

/// Default per-unit timeout
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const PROBE_PROMPT: &str = "Reply with the single word OK.";

/// Runs the configured agent command
#[derive(Debug, Clone)]
pub struct CommandAgent {
    spec: CommandSpec,
}

impl CommandAgent {
    /// Create an agent backend from its command config
    pub fn new(config: &CommandConfig) -> Result<Self, BackendConfigError> {
        Ok(Self {
            spec: CommandSpec::from_config("agent", config, DEFAULT_AGENT_TIMEOUT)?,
        })
    }

    fn unit_env(unit: &TaskUnit, workspace: &Path) -> Vec<(&'static str, String)> {
        vec![
            ("TIERBENCH_TIER", unit.tier_id().to_string()),
            ("TIERBENCH_SUBTEST", unit.subtest_id().to_string()),
            ("TIERBENCH_RUN", unit.run_number().to_string()),
            ("TIERBENCH_WORKSPACE", workspace.display().to_string()),
        ]
    }
}

#[async_trait]
impl AgentExecutor for CommandAgent {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, unit: &TaskUnit, workspace: &Path) -> Result<AgentOutput, AgentError> {
        let env = Self::unit_env(unit, workspace);
        let output = run_command(&self.spec, &unit.task_prompt, Some(workspace), &env)
            .await
            .map_err(to_agent_error)?;
        if output.killed {
            return Err(AgentError::Crashed(format!(
                "killed by a signal after {:?}: {}",
                output.duration,
                truncate(output.stderr.trim(), 512)
            )));
        }

        let summary = last_json_line(&output.stdout);
        let token_stats = summary.as_ref().map(extract_usage).unwrap_or_default();
        let cost_usd = summary.as_ref().and_then(extract_cost).unwrap_or(0.0);

        if summary.is_none() && output.success() {
            tracing::debug!(unit = %unit.key, "Agent printed no usage summary");
        }

        Ok(AgentOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            token_stats,
            cost_usd,
            duration: output.duration,
        })
    }

    /// Answers with stdout and stderr combined, whatever the exit code
    async fn probe(&self) -> Result<String, AgentError> {
        let output = run_command(&self.spec, PROBE_PROMPT, None, &[])
            .await
            .map_err(to_agent_error)?;
        Ok(format!("{}\n{}", output.stdout, truncate(&output.stderr, 4096)))
    }
}

fn to_agent_error(err: CommandError) -> AgentError {
    match err {
        CommandError::Spawn { .. } => AgentError::Spawn(err.to_string()),
        CommandError::Timeout(limit) => AgentError::Timeout(limit),
        CommandError::Io(e) => AgentError::Io(e),
    }
}

/// Extract token usage from an agent summary object.
///
/// Accepts both `input_tokens`/`output_tokens` and
/// `prompt_tokens`/`completion_tokens`, nested under `usage` or top-level.
fn extract_usage(value: &Value) -> TokenStats {
    let usage = value.get("usage").unwrap_or(value);
    let count = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| usage.get(*name).and_then(Value::as_u64))
            .unwrap_or(0)
    };
    TokenStats::new(
        count(&["input_tokens", "prompt_tokens"]),
        count(&["output_tokens", "completion_tokens"]),
        count(&["cache_read_input_tokens", "cache_read_tokens"]),
        count(&["cache_creation_input_tokens", "cache_creation_tokens"]),
    )
}

fn extract_cost(value: &Value) -> Option<f64> {
    ["total_cost_usd", "cost_usd"]
        .iter()
        .find_map(|name| value.get(*name).and_then(Value::as_f64))
        .filter(|cost| cost.is_finite() && *cost >= 0.0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::tests::sh;
    use tierbench_core::UnitKey;

    fn unit() -> TaskUnit {
        TaskUnit::new(
            UnitKey::new("T2", "s07", 3),
            "Rename the config loader",
            vec!["judge-a".into()],
        )
    }

    fn agent(script: &str) -> CommandAgent {
        CommandAgent::new(&sh(script, Some(10))).unwrap()
    }

    #[tokio::test]
    async fn test_execute_reads_usage_summary() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(
            r#"read prompt; echo "got: $prompt"
echo '{"usage": {"input_tokens": 33, "output_tokens": 812, "cache_read_input_tokens": 195735}, "total_cost_usd": 0.41}'"#,
        );

        let output = agent.execute(&unit(), dir.path()).await.unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.starts_with("got: Rename the config loader"));
        assert_eq!(output.token_stats.input_tokens, 33);
        assert_eq!(output.token_stats.output_tokens, 812);
        assert_eq!(output.token_stats.total_input(), 195_768);
        assert_eq!(output.cost_usd, 0.41);
    }

    #[tokio::test]
    async fn test_execute_exports_unit_identity() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(r#"echo "$TIERBENCH_TIER $TIERBENCH_SUBTEST $TIERBENCH_RUN"; pwd >&2"#);

        let output = agent.execute(&unit(), dir.path()).await.unwrap();

        assert_eq!(output.stdout.trim(), "T2 s07 3");
        assert_eq!(
            std::fs::canonicalize(output.stderr.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(output.token_stats, TokenStats::default());
        assert_eq!(output.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_execute_tolerates_missing_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let output = agent("echo ok")
            .execute(&unit(), &dir.path().join("missing"))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_returned_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let output = agent("echo 'API Error: 429 rate limit' >&2; exit 1")
            .execute(&unit(), dir.path())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.stderr.contains("429"));
    }

    #[tokio::test]
    async fn test_signal_kill_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let err = agent("echo 'segmentation fault' >&2; kill -9 $$")
            .execute(&unit(), dir.path())
            .await
            .unwrap_err();
        match err {
            AgentError::Crashed(message) => assert!(message.contains("segmentation fault")),
            other => panic!("expected crash, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_agent_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandAgent::new(&sh("sleep 5", Some(1)))
            .unwrap()
            .execute(&unit(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_probe_returns_combined_text() {
        let text = agent("cat >/dev/null; echo 'Too Many Requests' >&2; exit 1")
            .probe()
            .await
            .unwrap();
        assert!(text.contains("Too Many Requests"));
    }

    #[test]
    fn test_extract_usage_openai_names() {
        let value: Value = serde_json::json!({
            "prompt_tokens": 10,
            "completion_tokens": 4,
            "cost_usd": 0.002
        });
        let stats = extract_usage(&value);
        assert_eq!(stats.input_tokens, 10);
        assert_eq!(stats.output_tokens, 4);
        assert_eq!(extract_cost(&value), Some(0.002));
        assert_eq!(extract_cost(&serde_json::json!({"cost_usd": -1.0})), None);
    }
}
