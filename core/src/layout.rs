//! On-disk artifact layout and atomic file helpers
//!
//! ```text
//! <results>/
//!   checkpoint.json
//!   summary.json
//!   <tier>/<subtest>/run_NN/
//!     task_prompt.md
//!     workspace/
//!     agent/{stdout.log, stderr.log, output.json, result.json, timing.json}
//!     judge/judge_NN/{judgment.json, result.json, timing.json}
//!     run_result.json
//! ```
//!
//! `agent/output.json` and `judge/judge_NN/judgment.json` are raw records;
//! every `result.json` and `run_result.json` is derived and can be rebuilt.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{EvalError, EvalResult};
use crate::task::UnitKey;

/// Root of an experiment's artifact tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    /// Layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checkpoint file
    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join("checkpoint.json")
    }

    /// Experiment summary file
    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary.json")
    }

    /// Directory of one unit
    pub fn unit_dir(&self, key: &UnitKey) -> UnitDir {
        UnitDir::new(
            self.root
                .join(&key.tier_id)
                .join(&key.subtest_id)
                .join(key.run_dir_name()),
        )
    }
}

/// Paths inside one unit directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDir {
    path: PathBuf,
}

impl UnitDir {
    /// Wrap a unit directory path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The unit directory itself
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the unit directory exists at all
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Task prompt given to the agent
    pub fn task_prompt(&self) -> PathBuf {
        self.path.join("task_prompt.md")
    }

    /// Agent working directory
    pub fn workspace(&self) -> PathBuf {
        self.path.join("workspace")
    }

    /// Agent artifacts directory
    pub fn agent_dir(&self) -> PathBuf {
        self.path.join("agent")
    }

    /// Captured agent stdout
    pub fn agent_stdout(&self) -> PathBuf {
        self.agent_dir().join("stdout.log")
    }

    /// Captured agent stderr
    pub fn agent_stderr(&self) -> PathBuf {
        self.agent_dir().join("stderr.log")
    }

    /// Raw agent record
    pub fn agent_output(&self) -> PathBuf {
        self.agent_dir().join("output.json")
    }

    /// Derived agent summary
    pub fn agent_result(&self) -> PathBuf {
        self.agent_dir().join("result.json")
    }

    /// Agent phase timing
    pub fn agent_timing(&self) -> PathBuf {
        self.agent_dir().join("timing.json")
    }

    /// Directory of one judge slot
    pub fn judge_dir(&self, judge_number: u32) -> PathBuf {
        self.path
            .join("judge")
            .join(format!("judge_{:02}", judge_number))
    }

    /// Raw judgment of one slot
    pub fn judgment(&self, judge_number: u32) -> PathBuf {
        self.judge_dir(judge_number).join("judgment.json")
    }

    /// Derived judge summary of one slot
    pub fn judge_result(&self, judge_number: u32) -> PathBuf {
        self.judge_dir(judge_number).join("result.json")
    }

    /// Timing of one judge slot
    pub fn judge_timing(&self, judge_number: u32) -> PathBuf {
        self.judge_dir(judge_number).join("timing.json")
    }

    /// Consolidated run result
    pub fn run_result(&self) -> PathBuf {
        self.path.join("run_result.json")
    }

    /// Relative path of a file inside this unit directory
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.path).unwrap_or(path)
    }
}

/// Create a directory and its parents
pub fn ensure_dir(path: &Path) -> EvalResult<()> {
    fs::create_dir_all(path).map_err(|e| EvalError::io(path, e))
}

/// Write bytes via a temp file + fsync + rename so readers never see a
/// partially written file
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> EvalResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    let tmp = parent.join(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    ));

    let written = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(EvalError::io(path, e));
    }

    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Atomically write a text file
pub fn write_text_atomic(path: &Path, text: &str) -> EvalResult<()> {
    write_bytes_atomic(path, text.as_bytes())
}

/// Atomically write pretty-printed JSON
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> EvalResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| EvalError::serialization(path, e))?;
    write_bytes_atomic(path, &bytes)
}

/// Read and decode a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> EvalResult<T> {
    let bytes = fs::read(path).map_err(|e| EvalError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| EvalError::serialization(path, e))
}

/// Read a JSON file, `None` if it does not exist
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> EvalResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EvalError::serialization(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EvalError::io(path, e)),
    }
}

/// Read a text file, empty if it does not exist
pub fn read_text_or_empty(path: &Path) -> EvalResult<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(EvalError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_unit_paths() {
        let layout = ArtifactLayout::new("/r");
        let unit = layout.unit_dir(&UnitKey::new("T2", "007", 4));
        assert_eq!(unit.path(), Path::new("/r/T2/007/run_04"));
        assert_eq!(unit.agent_output(), Path::new("/r/T2/007/run_04/agent/output.json"));
        assert_eq!(
            unit.judge_result(2),
            Path::new("/r/T2/007/run_04/judge/judge_02/result.json")
        );
        assert_eq!(layout.checkpoint_path(), Path::new("/r/checkpoint.json"));
        assert_eq!(
            unit.relative(&unit.agent_stdout()),
            Path::new("agent/stdout.log")
        );
    }

    #[test]
    fn test_atomic_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/value.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();

        let back: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_json_opt_missing() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Vec<i32>> = read_json_opt(&dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_read_json_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let err = read_json::<Vec<i32>>(&path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[test]
    fn test_read_text_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_text_or_empty(&dir.path().join("none.log")).unwrap(), "");
    }
}
