//! Run context settings

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Settings for a run context and its local backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Checkpoint settings
    pub checkpoint: CheckpointSettings,

    /// Progress and metric saver settings
    pub savers: SaverConfig,

    /// Signal handling settings
    pub signals: SignalConfig,

    /// Retry policy for remote transfers
    pub transfer: RetryConfig,
}

impl RunSettings {
    /// Load settings from a JSON file, missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| Error::InvalidSettings {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        let settings: RunSettings =
            serde_json::from_slice(&raw).map_err(|e| Error::InvalidSettings {
                message: format!("Failed to parse {}: {}", path.display(), e),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.savers.flush_threshold == 0 {
            return Err(Error::InvalidSettings {
                message: "savers.flush_threshold must be at least 1".to_string(),
            });
        }
        if self.transfer.backoff_multiplier < 1.0 {
            return Err(Error::InvalidSettings {
                message: "transfer.backoff_multiplier must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Fsync the checkpoint directory after each rename
    pub sync_parent_dir: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            sync_parent_dir: true,
        }
    }
}

/// Durable saver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    /// Number of buffered records that triggers a flush
    pub flush_threshold: usize,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 16,
        }
    }
}

/// Signal handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Listen for SIGINT/SIGTERM while the run is active
    ///
    /// Once installed, the process keeps catching both signals after the run
    /// ends (see `SignalHandler::install`).
    pub install: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self { install: true }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl RetryConfig {
    /// A policy that makes a single attempt
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let delay = Duration::from_millis(millis.min(u64::MAX as f64) as u64);
        delay.min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Durations are serialized as integer milliseconds
mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
