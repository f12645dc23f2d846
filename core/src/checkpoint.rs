//! Durable per-unit completion state
//!
//! The checkpoint is the only state shared across workers. Every mutation
//! goes through one mutex and is written to disk (temp file + rename)
//! before the call returns, so a crash loses at most the units that were
//! in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{EvalError, EvalResult};
use crate::layout::{read_json, write_json_atomic};
use crate::task::UnitKey;

const CHECKPOINT_VERSION: u32 = 1;

/// Lifecycle status of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Not yet started
    Pending,
    /// Dispatched to a worker
    InProgress,
    /// Agent and every judge slot finished
    Complete,
    /// Terminal failure
    Failed,
    /// Throttled; will be resubmitted after backoff
    RateLimited,
}

impl UnitStatus {
    /// Complete and Failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Complete | UnitStatus::Failed)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Complete => "complete",
            UnitStatus::Failed => "failed",
            UnitStatus::RateLimited => "rate_limited",
        };
        f.write_str(name)
    }
}

/// Checkpoint entry for one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Current status
    pub status: UnitStatus,
    /// Number of times the unit was dispatched
    #[serde(default)]
    pub attempts: u32,
    /// Last failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Free-form details attached by the recorder
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Additional fields attached to a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordExtra {
    /// Failure reason; cleared when `None`
    pub error: Option<String>,
    /// Merged into the record's `extra` map
    pub fields: BTreeMap<String, Value>,
}

impl RecordExtra {
    /// No extra fields
    pub fn none() -> Self {
        Self::default()
    }

    /// Attach a failure reason
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Serialized checkpoint state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version
    pub version: u32,
    /// Experiment this checkpoint belongs to
    pub experiment_id: String,
    /// When the experiment first started
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Per-unit state, at most one entry per key
    #[serde(default)]
    pub units: BTreeMap<UnitKey, UnitRecord>,
    /// End of the current rate-limit pause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_until: Option<DateTime<Utc>>,
    /// Number of rate-limit pauses so far
    #[serde(default)]
    pub pause_count: u32,
}

impl Checkpoint {
    /// Empty checkpoint for an experiment
    pub fn new(experiment_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            experiment_id: experiment_id.into(),
            created_at: now,
            updated_at: now,
            units: BTreeMap::new(),
            rate_limit_until: None,
            pause_count: 0,
        }
    }

    /// Status of one unit
    pub fn status_of(&self, key: &UnitKey) -> Option<UnitStatus> {
        self.units.get(key).map(|r| r.status)
    }

    /// Count units per status
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.units.values() {
            counts.add(record.status);
        }
        counts
    }

    /// A unit marked in progress with no later terminal mark was
    /// interrupted mid-run: put it back to pending
    fn reclassify_interrupted(&mut self) -> usize {
        let mut reset = 0;
        for record in self.units.values_mut() {
            if record.status == UnitStatus::InProgress {
                record.status = UnitStatus::Pending;
                record.updated_at = Utc::now();
                reset += 1;
            }
        }
        reset
    }
}

/// Units per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Pending units
    pub pending: usize,
    /// In-progress units
    pub in_progress: usize,
    /// Complete units
    pub complete: usize,
    /// Failed units
    pub failed: usize,
    /// Rate-limited units
    pub rate_limited: usize,
}

impl StatusCounts {
    fn add(&mut self, status: UnitStatus) {
        match status {
            UnitStatus::Pending => self.pending += 1,
            UnitStatus::InProgress => self.in_progress += 1,
            UnitStatus::Complete => self.complete += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::RateLimited => self.rate_limited += 1,
        }
    }

    /// All units
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.complete + self.failed + self.rate_limited
    }
}

/// Mutex-guarded, file-backed checkpoint
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<Checkpoint>,
}

impl CheckpointStore {
    /// Start a fresh checkpoint at `path`, replacing any existing one
    pub fn create(path: impl Into<PathBuf>, experiment_id: &str) -> EvalResult<Self> {
        let store = Self {
            path: path.into(),
            state: Mutex::new(Checkpoint::new(experiment_id)),
        };
        {
            let state = store.lock();
            store.persist(&state)?;
        }
        Ok(store)
    }

    /// Load a checkpoint from its last durable write
    ///
    /// Units left `in_progress` are reclassified to `pending`.
    pub fn load(path: impl Into<PathBuf>) -> EvalResult<Self> {
        let path = path.into();
        let mut checkpoint: Checkpoint = read_json(&path)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(EvalError::checkpoint(format!(
                "unsupported checkpoint version {} in {}",
                checkpoint.version,
                path.display()
            )));
        }

        let reset = checkpoint.reclassify_interrupted();
        if reset > 0 {
            tracing::info!(
                reset,
                path = %path.display(),
                "Reclassified interrupted units as pending"
            );
        }

        let store = Self {
            path,
            state: Mutex::new(checkpoint),
        };
        if reset > 0 {
            let state = store.lock();
            store.persist(&state)?;
        }
        Ok(store)
    }

    /// Resume the checkpoint at `path` if present, else create one
    ///
    /// Refuses to resume a checkpoint written by a different experiment.
    pub fn open_or_create(path: impl Into<PathBuf>, experiment_id: &str) -> EvalResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Self::create(path, experiment_id);
        }
        let store = Self::load(path)?;
        let found = store.lock().experiment_id.clone();
        if found != experiment_id {
            return Err(EvalError::checkpoint(format!(
                "checkpoint {} belongs to experiment {:?}, not {:?}",
                store.path.display(),
                found,
                experiment_id
            )));
        }
        Ok(store)
    }

    /// Checkpoint file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a status change for one unit
    ///
    /// Overwrites the previous status for `key`; recording the same status
    /// twice leaves one entry. Entering `in_progress` counts an attempt.
    pub fn record(&self, key: &UnitKey, status: UnitStatus, extra: RecordExtra) -> EvalResult<()> {
        let mut state = self.lock();
        let now = Utc::now();
        let record = state
            .units
            .entry(key.clone())
            .or_insert_with(|| UnitRecord {
                status,
                attempts: 0,
                error: None,
                updated_at: now,
                extra: BTreeMap::new(),
            });
        record.status = status;
        record.updated_at = now;
        record.error = extra.error;
        record.extra.extend(extra.fields);
        if status == UnitStatus::InProgress {
            record.attempts += 1;
        }
        state.updated_at = now;
        self.persist(&state)
    }

    /// [`record`](Self::record) on the blocking pool
    ///
    /// The fsync and rename run off the async worker threads.
    pub async fn record_async(
        self: &Arc<Self>,
        key: &UnitKey,
        status: UnitStatus,
        extra: RecordExtra,
    ) -> EvalResult<()> {
        let store = Arc::clone(self);
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.record(&key, status, extra))
            .await
            .map_err(|e| EvalError::checkpoint(format!("checkpoint write task failed: {}", e)))?
    }

    /// Add `pending` entries for keys not yet tracked; existing entries
    /// are left untouched
    pub fn register_pending<'a>(&self, keys: impl IntoIterator<Item = &'a UnitKey>) -> EvalResult<usize> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut added = 0;
        for key in keys {
            if !state.units.contains_key(key) {
                state.units.insert(
                    key.clone(),
                    UnitRecord {
                        status: UnitStatus::Pending,
                        attempts: 0,
                        error: None,
                        updated_at: now,
                        extra: BTreeMap::new(),
                    },
                );
                added += 1;
            }
        }
        if added > 0 {
            state.updated_at = now;
            self.persist(&state)?;
        }
        Ok(added)
    }

    /// Status of one unit
    pub fn status_of(&self, key: &UnitKey) -> Option<UnitStatus> {
        self.lock().status_of(key)
    }

    /// Full record of one unit
    pub fn record_of(&self, key: &UnitKey) -> Option<UnitRecord> {
        self.lock().units.get(key).cloned()
    }

    /// Keys currently in `status`
    pub fn keys_with_status(&self, status: UnitStatus) -> Vec<UnitKey> {
        self.lock()
            .units
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Units per status
    pub fn counts(&self) -> StatusCounts {
        self.lock().counts()
    }

    /// Copy of the whole state
    pub fn snapshot(&self) -> Checkpoint {
        self.lock().clone()
    }

    /// Current pause deadline
    pub fn rate_limit_until(&self) -> Option<DateTime<Utc>> {
        self.lock().rate_limit_until
    }

    /// Number of pauses so far
    pub fn pause_count(&self) -> u32 {
        self.lock().pause_count
    }

    /// Persist a pause deadline and bump the pause counter
    ///
    /// Returns the new pause count.
    pub fn begin_pause(&self, until: DateTime<Utc>) -> EvalResult<u32> {
        let mut state = self.lock();
        state.rate_limit_until = Some(until);
        state.pause_count += 1;
        state.updated_at = Utc::now();
        self.persist(&state)?;
        Ok(state.pause_count)
    }

    /// Overwrite the pause deadline without counting a new pause
    pub fn set_rate_limit_until(&self, until: Option<DateTime<Utc>>) -> EvalResult<()> {
        let mut state = self.lock();
        if state.rate_limit_until == until {
            return Ok(());
        }
        state.rate_limit_until = until;
        state.updated_at = Utc::now();
        self.persist(&state)
    }

    /// Clear the pause deadline after the wait finished
    pub fn clear_rate_limit(&self) -> EvalResult<()> {
        self.set_rate_limit_until(None)
    }

    fn lock(&self) -> MutexGuard<'_, Checkpoint> {
        // A panic while holding the guard cannot leave a half-applied
        // record: every mutation is complete before persist is called.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &Checkpoint) -> EvalResult<()> {
        write_json_atomic(&self.path, state)
            .map_err(|e| EvalError::checkpoint(format!("failed to persist checkpoint: {}", e)))
    }
}
