//! Judge backend that runs an external command per judge slot

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tierbench_core::rate_limit::detect_rate_limit;
use tierbench_core::{CommandConfig, Grade, JudgeError, JudgeExecutor, JudgeRequest, JudgeVerdict};

use crate::command::{
    last_json_line, run_command, truncate, BackendConfigError, CommandError, CommandSpec,
};

/// Default per-slot timeout
pub const DEFAULT_JUDGE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Agent output beyond this is cut from the judge prompt
const MAX_AGENT_OUTPUT: usize = 64 * 1024;

/// Runs the configured judge command
///
/// The rendered evaluation prompt goes to stdin; the judge model is passed
/// as `TIERBENCH_JUDGE_MODEL`. The command must print a JSON verdict
/// (`score`, `passed`, optional `grade` and `reasoning`), either bare or as
/// a JSON string under `result`.
#[derive(Debug, Clone)]
pub struct CommandJudge {
    spec: CommandSpec,
}

impl CommandJudge {
    /// Create a judge backend from its command config
    pub fn new(config: &CommandConfig) -> Result<Self, BackendConfigError> {
        Ok(Self {
            spec: CommandSpec::from_config("judge", config, DEFAULT_JUDGE_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl JudgeExecutor for CommandJudge {
    fn name(&self) -> &str {
        "command"
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
        let mut env = vec![
            ("TIERBENCH_JUDGE_MODEL", request.model.clone()),
            ("TIERBENCH_JUDGE_NUMBER", request.judge_number.to_string()),
        ];
        if let Some(workspace) = &request.workspace {
            env.push(("TIERBENCH_WORKSPACE", workspace.display().to_string()));
        }

        let prompt = render_prompt(request);
        let output = run_command(&self.spec, &prompt, request.workspace.as_deref(), &env)
            .await
            .map_err(|e| match e {
                CommandError::Timeout(limit) => JudgeError::Timeout(limit),
                CommandError::Io(e) => JudgeError::Io(e),
                spawn @ CommandError::Spawn { .. } => JudgeError::Backend(spawn.to_string()),
            })?;

        if !output.success() {
            let text = format!("{}\n{}", output.stderr, output.stdout);
            if let Some(info) = detect_rate_limit(&text, "judge") {
                return Err(JudgeError::RateLimited(info));
            }
            return Err(JudgeError::Backend(format!(
                "exit code {}: {}",
                output.exit_code,
                truncate(output.stderr.trim(), 500)
            )));
        }

        parse_verdict(&output.stdout)
    }
}

/// Evaluation prompt for one judge slot
pub fn render_prompt(request: &JudgeRequest) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Task\n\n{}\n", request.task_prompt.trim());
    let _ = writeln!(
        prompt,
        "# Agent result\n\nExit code: {}\n",
        request.agent_exit_code
    );
    let output = truncate(&request.agent_output, MAX_AGENT_OUTPUT);
    let _ = writeln!(prompt, "```\n{}\n```\n", output.trim_end());
    if output.len() < request.agent_output.len() {
        let _ = writeln!(
            prompt,
            "(output truncated, {} bytes omitted)\n",
            request.agent_output.len() - output.len()
        );
    }
    match &request.workspace {
        Some(workspace) => {
            let _ = writeln!(prompt, "Workspace: {}\n", workspace.display());
        }
        None => prompt.push_str("Workspace: not available\n\n"),
    }
    prompt.push_str(
        "# Instructions\n\nScore how well the agent solved the task. Answer with one line of \
         JSON: {\"score\": <0.0-1.0>, \"passed\": <true|false>, \"grade\": \"S|A|B|C|D|F\", \
         \"reasoning\": \"...\"}\n",
    );
    prompt
}

/// Read a verdict from judge stdout
fn parse_verdict(stdout: &str) -> Result<JudgeVerdict, JudgeError> {
    let value = last_json_line(stdout)
        .or_else(|| embedded_object(stdout))
        .ok_or_else(|| {
            JudgeError::InvalidResponse(format!(
                "no JSON verdict in output: {}",
                truncate(stdout.trim(), 200)
            ))
        })?;
    verdict_from_value(&value)
}

fn verdict_from_value(value: &Value) -> Result<JudgeVerdict, JudgeError> {
    // CLI wrappers put the model's answer in a string under `result`
    if value.get("score").is_none() {
        if let Some(inner) = value.get("result").and_then(Value::as_str) {
            return parse_verdict(inner);
        }
    }

    let score = value
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| JudgeError::InvalidResponse("verdict has no numeric score".into()))?;
    let passed = value
        .get("passed")
        .or_else(|| value.get("pass"))
        .and_then(Value::as_bool)
        .unwrap_or(score >= 0.5);
    let grade = value
        .get("grade")
        .and_then(Value::as_str)
        .and_then(parse_grade);
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(JudgeVerdict {
        score,
        passed,
        grade,
        reasoning,
    })
}

fn parse_grade(s: &str) -> Option<Grade> {
    match s.trim().to_ascii_uppercase().as_str() {
        "S" => Some(Grade::S),
        "A" => Some(Grade::A),
        "B" => Some(Grade::B),
        "C" => Some(Grade::C),
        "D" => Some(Grade::D),
        "F" => Some(Grade::F),
        _ => None,
    }
}

/// Outermost `{...}` span that parses as an object
fn embedded_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}
