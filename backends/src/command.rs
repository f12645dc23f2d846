//! Subprocess plumbing shared by the agent and judge backends

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tierbench_core::CommandConfig;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Backend configuration error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendConfigError {
    /// No program configured for the named backend
    #[error("no program configured for the {0} backend")]
    MissingProgram(&'static str),

    /// A timeout value is out of acceptable range
    #[error("invalid timeout: {0:?}")]
    InvalidTimeout(Duration),
}

/// Validated command plus its timeout
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandSpec {
    /// Validate `config` for the backend named `role`
    pub fn from_config(
        role: &'static str,
        config: &CommandConfig,
        default_timeout: Duration,
    ) -> Result<Self, BackendConfigError> {
        if !config.is_configured() {
            return Err(BackendConfigError::MissingProgram(role));
        }
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        if timeout.is_zero() {
            return Err(BackendConfigError::InvalidTimeout(timeout));
        }
        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout,
        })
    }

    /// Per-invocation timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Program name
    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Captured result of one invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, -1 when killed by a signal
    pub exit_code: i32,
    /// The process was terminated by a signal instead of exiting
    pub killed: bool,
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
    /// Wall-clock time
    pub duration: Duration,
}

impl CommandOutput {
    /// Whether the process exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Invocation failure
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be started
    #[error("cannot start {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// The process outlived its timeout and was killed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Reading or writing the pipes failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `spec` with `input` on stdin
///
/// `cwd` is used only when it is an existing directory. The child is
/// killed if the timeout fires or the future is dropped.
pub async fn run_command(
    spec: &CommandSpec,
    input: &str,
    cwd: Option<&Path>,
    extra_env: &[(&str, String)],
) -> Result<CommandOutput, CommandError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd.filter(|d| d.is_dir()) {
        command.current_dir(dir);
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdin = child.stdin.take();
    let writer = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };

    let run = async {
        let (written, output) = tokio::join!(writer, child.wait_with_output());
        match written {
            // The child may exit without reading its input
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
            _ => {}
        }
        output
    };

    let output = tokio::time::timeout(spec.timeout, run)
        .await
        .map_err(|_| CommandError::Timeout(spec.timeout))??;

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        killed: output.status.code().is_none(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
    };
    tracing::debug!(
        program = %spec.program,
        exit_code = result.exit_code,
        killed = result.killed,
        duration_ms = result.duration.as_millis() as u64,
        stdout_bytes = result.stdout.len(),
        stderr_bytes = result.stderr.len(),
        "Command finished"
    );
    Ok(result)
}

/// Last non-empty line of `text`, parsed as a JSON object
pub(crate) fn last_json_line(text: &str) -> Option<serde_json::Value> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter(|value| value.is_object())
}

/// Cut `text` to at most `max` bytes on a char boundary
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
