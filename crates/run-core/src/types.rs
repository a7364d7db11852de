//! Core type definitions for the training run context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unique identifier types
pub type RunId = String;
pub type CheckpointId = String;
pub type SnapshotId = String;

/// Training step and epoch counters
pub type Step = u64;
pub type Epoch = u64;

/// Nested string-keyed mapping used for configuration, metadata and manifests
pub type Mapping = serde_json::Map<String, serde_json::Value>;

/// Immutable identity of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Unique run identifier
    pub run_id: RunId,

    /// Timestamp when the run context was created
    pub created_at: DateTime<Utc>,

    /// Working directory owned by the run
    pub working_dir: PathBuf,
}

impl RunIdentity {
    pub fn new(run_id: impl Into<RunId>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            working_dir: working_dir.into(),
        }
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Context built but not yet entered
    Created,

    /// Context entered, training in progress
    Active,

    /// Scope exited normally
    Completed,

    /// Scope exited after an interruption signal
    Interrupted,

    /// Scope exited with an unhandled error
    Failed,
}

impl RunState {
    /// Returns true if no transition can leave this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Interrupted | RunState::Failed
        )
    }

    /// Returns true if `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match (self, next) {
            (RunState::Created, RunState::Active) => true,
            (RunState::Active, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Created => "created",
            RunState::Active => "active",
            RunState::Completed => "completed",
            RunState::Interrupted => "interrupted",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Persisted run status (`run.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Error that drove the run to `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A fully loaded checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    /// Caller-supplied identifier
    pub id: CheckpointId,

    /// Opaque checkpoint payload
    pub payload: bytes::Bytes,

    /// Caller-supplied metadata
    pub metadata: Mapping,

    /// Timestamp when the checkpoint was saved
    pub created_at: DateTime<Utc>,
}

/// Checkpoint listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Caller-supplied identifier
    pub id: CheckpointId,

    /// Timestamp when the checkpoint was saved
    pub created_at: DateTime<Utc>,

    /// Size of the payload in bytes
    pub size_bytes: u64,

    /// Location of the artifact
    pub path: PathBuf,
}

/// Training progress record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub epoch: Epoch,
    pub step: Step,

    /// Free-form progress details (operation, units, totals...)
    #[serde(default)]
    pub extra: Mapping,

    pub recorded_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(epoch: Epoch, step: Step, extra: Mapping) -> Self {
        Self {
            epoch,
            step,
            extra,
            recorded_at: Utc::now(),
        }
    }
}

/// Training metric record, one point of the time series `name`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,

    /// Non-finite values are persisted as `null`
    #[serde(with = "finite_or_null")]
    pub value: f64,

    pub step: Step,
    pub recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, value: f64, step: Step) -> Self {
        Self {
            name: name.into(),
            value,
            step,
            recorded_at: Utc::now(),
        }
    }
}

impl PartialEq for MetricRecord {
    fn eq(&self, other: &Self) -> bool {
        let same_value = self.value == other.value || (self.value.is_nan() && other.value.is_nan());
        self.name == other.name
            && same_value
            && self.step == other.step
            && self.recorded_at == other.recorded_at
    }
}

/// A dataset snapshot materialized on local disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    pub snapshot_id: SnapshotId,
    pub local_path: PathBuf,
    pub manifest: Mapping,
}

/// Metric values travel as JSON numbers, with NaN and infinities as null
mod finite_or_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
