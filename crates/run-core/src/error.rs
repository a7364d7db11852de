//! Error types for the training run context

use thiserror::Error;

/// Result type alias using the run Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the training run context
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid settings: {message}")]
    InvalidSettings { message: String },

    // Model errors
    #[error("could not find a model at {path}")]
    ModelNotFound { path: String },

    #[error("Model artifact error: {message}")]
    ModelArtifact { message: String },

    // Checkpoint errors
    #[error("{}", not_found_message(.checkpoint_id))]
    CheckpointNotFound { checkpoint_id: Option<String> },

    #[error("Checkpoint write failed: {checkpoint_id} - {message}")]
    CheckpointWriteFailed {
        checkpoint_id: String,
        message: String,
    },

    #[error("Checkpoint corrupted: {checkpoint_id} - {reason}")]
    CheckpointCorrupted {
        checkpoint_id: String,
        reason: String,
    },

    #[error("Invalid checkpoint id {checkpoint_id:?}: {reason}")]
    InvalidCheckpointId {
        checkpoint_id: String,
        reason: String,
    },

    // Dataset snapshot errors
    #[error("Snapshot fetch failed: {snapshot_id} - {message}")]
    SnapshotFetch {
        snapshot_id: String,
        message: String,
    },

    #[error("Datum index {index} out of range for {num_datums} datums")]
    DatumIndexOutOfRange { index: usize, num_datums: usize },

    // Metric errors
    #[error("Invalid metric name {name:?}: {reason}")]
    InvalidMetricName { name: String, reason: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    #[error("Remote prefix must end with a forward slash: {prefix:?}")]
    InvalidRemotePrefix { prefix: String },

    // Run lifecycle errors
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Run {run_id} is not active (state: {state})")]
    RunNotActive { run_id: String, state: String },

    #[error("RunContext was interrupted")]
    Interrupted,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Io(_))
    }

    /// Returns true if this error reports a cooperative interruption
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
        }
    }
}

fn not_found_message(checkpoint_id: &Option<String>) -> String {
    match checkpoint_id {
        Some(id) => format!("could not find a checkpoint with id {}", id),
        None => "could not find the most recent checkpoint".to_string(),
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::storage("connection reset");
        assert!(err.is_retryable());

        let err = Error::CheckpointCorrupted {
            checkpoint_id: "step-1".to_string(),
            reason: "bad magic".to_string(),
        };
        assert!(!err.is_retryable());

        let err = Error::InvalidRemotePrefix {
            prefix: "datasets".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_checkpoint_not_found_message() {
        let err = Error::CheckpointNotFound {
            checkpoint_id: Some("step-10".to_string()),
        };
        assert_eq!(err.to_string(), "could not find a checkpoint with id step-10");

        let err = Error::CheckpointNotFound {
            checkpoint_id: None,
        };
        assert_eq!(err.to_string(), "could not find the most recent checkpoint");
    }

    #[test]
    fn test_interruption() {
        assert!(Error::Interrupted.is_interruption());
        assert!(!Error::config("bad").is_interruption());
    }
}
