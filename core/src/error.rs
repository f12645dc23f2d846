//! Error types for tierbench-core

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Classification of engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or missing configuration
    Config,
    /// Filesystem failure
    Io,
    /// JSON/YAML encode or decode failure
    Serialization,
    /// Checkpoint state could not be read or written
    Checkpoint,
    /// Agent backend failure
    Agent,
    /// Judge backend failure
    Judge,
    /// External provider throttling
    RateLimited,
    /// The worker pool became unusable
    PoolBroken,
    /// Operation aborted by shutdown
    Shutdown,
    /// On-disk artifacts are inconsistent or incomplete
    Integrity,
    /// Anything else
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Agent => "agent",
            ErrorKind::Judge => "judge",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::PoolBroken => "pool_broken",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Core error type
#[derive(Error, Debug, Clone)]
#[error("{kind} error: {message}")]
pub struct EvalError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human readable detail
    pub message: String,
}

impl EvalError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// A required builder field was not provided
    pub fn missing_config(field: &str) -> Self {
        Self::new(ErrorKind::Config, format!("missing required field: {}", field))
    }

    /// Filesystem error with the offending path
    pub fn io(path: &Path, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{}: {}", path.display(), err))
    }

    /// Encode/decode error with the offending path
    pub fn serialization(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::Serialization,
            format!("{}: {}", path.display(), err),
        )
    }

    /// Checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Checkpoint, message)
    }

    /// Agent backend error
    pub fn agent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Agent, message)
    }

    /// Judge backend error
    pub fn judge(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Judge, message)
    }

    /// Inconsistent artifacts
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    /// Shutdown requested
    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "shutdown requested")
    }
}

impl From<std::io::Error> for EvalError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, err.to_string())
    }
}

/// Result type alias
pub type EvalResult<T> = std::result::Result<T, EvalError>;
