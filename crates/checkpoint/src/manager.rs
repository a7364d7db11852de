//! Checkpoint capability and its local filesystem implementation

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use run_core::{CheckpointId, CheckpointInfo, CheckpointRecord, Error, Mapping, Result};
use storage::atomic;
use tracing::{debug, info, instrument, warn};

use crate::writer::CheckpointWriter;

/// Checkpoint persistence capability
#[async_trait]
pub trait CheckpointManager: Send + Sync {
    /// Persist `payload` and `metadata` under `id`, replacing any previous
    /// checkpoint with that id
    ///
    /// Once this returns `Ok` the checkpoint is visible to readers; if it
    /// fails or never returns, readers still see the previous state.
    async fn save(&self, id: &str, payload: Bytes, metadata: Mapping) -> Result<CheckpointInfo>;

    /// Load the checkpoint stored under `id`
    ///
    /// # Errors
    /// `CheckpointNotFound` if there is none
    async fn load(&self, id: &str) -> Result<CheckpointRecord>;

    /// Checkpoints in creation order, oldest first
    async fn list(&self) -> Result<Vec<CheckpointInfo>>;

    /// Load the most recently created checkpoint
    async fn latest(&self) -> Result<CheckpointRecord> {
        let checkpoints = self.list().await?;
        match checkpoints.last() {
            Some(info) => self.load(&info.id).await,
            None => Err(Error::CheckpointNotFound {
                checkpoint_id: None,
            }),
        }
    }
}

/// Shared handle to a checkpoint manager
pub type CheckpointManagerHandle = Arc<dyn CheckpointManager>;

/// Local checkpoint manager configuration
#[derive(Debug, Clone)]
pub struct LocalCheckpointManagerConfig {
    /// Directory holding `<checkpoint_id>` files
    pub base_path: PathBuf,

    /// Fsync the directory after each rename
    pub sync_parent_dir: bool,
}

impl LocalCheckpointManagerConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }
}

impl Default for LocalCheckpointManagerConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./checkpoints"),
            sync_parent_dir: true,
        }
    }
}

/// Checkpoints stored as files under one directory
pub struct LocalCheckpointManager {
    /// Configuration
    config: LocalCheckpointManagerConfig,

    /// Atomic file writer
    writer: CheckpointWriter,

    /// Checkpoint listing entries indexed by id
    index: RwLock<HashMap<CheckpointId, CheckpointInfo>>,

    /// Last creation timestamp handed out, keeps `created_at` strictly increasing
    last_created: Mutex<Option<DateTime<Utc>>>,
}

impl LocalCheckpointManager {
    /// Open (or create) a checkpoint directory
    ///
    /// Removes temp files abandoned by an interrupted writer and indexes the
    /// checkpoints already present. Unreadable checkpoints are skipped.
    pub async fn open(config: LocalCheckpointManagerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.base_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create checkpoint directory: {}", e),
            })?;

        let base_path = config.base_path.clone();
        let existing = tokio::task::spawn_blocking(move || scan_checkpoints(&base_path))
            .await
            .map_err(|e| Error::Internal {
                message: format!("Checkpoint scan task failed: {}", e),
            })??;

        let last_created = existing.iter().map(|info| info.created_at).max();
        let index = existing
            .into_iter()
            .map(|info| (info.id.clone(), info))
            .collect::<HashMap<_, _>>();

        info!(
            path = %config.base_path.display(),
            checkpoints = index.len(),
            "Checkpoint directory opened"
        );

        Ok(Self {
            writer: CheckpointWriter::new(config.sync_parent_dir),
            config,
            index: RwLock::new(index),
            last_created: Mutex::new(last_created),
        })
    }

    /// Directory holding the checkpoints
    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    fn path_for(&self, id: &str) -> PathBuf {
        id.split('/')
            .fold(self.config.base_path.clone(), |path, segment| path.join(segment))
    }

    fn next_created_at(&self) -> DateTime<Utc> {
        let mut last = self.last_created.lock();
        // Timestamps are stored with microsecond precision
        let now = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap_or_else(Utc::now);
        let next = match *last {
            Some(previous) if now <= previous => previous + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

#[async_trait]
impl CheckpointManager for LocalCheckpointManager {
    #[instrument(skip(self, payload, metadata), fields(size = payload.len()))]
    async fn save(&self, id: &str, payload: Bytes, metadata: Mapping) -> Result<CheckpointInfo> {
        validate_checkpoint_id(id)?;

        let path = self.path_for(id);
        let record = CheckpointRecord {
            id: id.to_string(),
            payload,
            metadata,
            created_at: self.next_created_at(),
        };

        self.writer.write(&path, &record).await?;

        let info = CheckpointInfo {
            id: record.id.clone(),
            created_at: record.created_at,
            size_bytes: record.payload.len() as u64,
            path,
        };
        if self.index.write().insert(info.id.clone(), info.clone()).is_some() {
            debug!(checkpoint_id = %id, "Replaced existing checkpoint");
        }
        Ok(info)
    }

    #[instrument(skip(self))]
    async fn load(&self, id: &str) -> Result<CheckpointRecord> {
        validate_checkpoint_id(id)?;
        CheckpointWriter::read(id, &self.path_for(id)).await
    }

    async fn list(&self) -> Result<Vec<CheckpointInfo>> {
        let mut checkpoints: Vec<_> = self.index.read().values().cloned().collect();
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(checkpoints)
    }
}

/// Check that `id` is a usable relative checkpoint path
///
/// Segments are separated by `/`; empty segments, `.`/`..`, backslashes and
/// segments starting with `.` (reserved for temp files) are rejected.
pub fn validate_checkpoint_id(id: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidCheckpointId {
        checkpoint_id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("identifier is empty"));
    }
    if id.contains('\\') || id.contains('\0') {
        return Err(invalid("identifier contains a forbidden character"));
    }
    for segment in id.split('/') {
        if segment.is_empty() {
            return Err(invalid("identifier has an empty path segment"));
        }
        if segment.starts_with('.') {
            return Err(invalid("path segments may not start with '.'"));
        }
    }
    Ok(())
}

fn scan_checkpoints(base_path: &Path) -> Result<Vec<CheckpointInfo>> {
    let mut found = Vec::new();
    let mut stack = vec![base_path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        atomic::sweep_temp_files(&dir)?;

        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }

            let Some(id) = checkpoint_id_for(base_path, &path) else {
                continue;
            };
            match CheckpointWriter::read_header(&id, &path) {
                Ok(header) => found.push(CheckpointInfo {
                    id,
                    created_at: header.created_at,
                    size_bytes: header.payload_len,
                    path,
                }),
                Err(e) => warn!(checkpoint_id = %id, error = %e, "Skipping unreadable checkpoint"),
            }
        }
    }

    Ok(found)
}

fn checkpoint_id_for(base_path: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base_path).ok()?;
    let id = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    validate_checkpoint_id(&id).ok().map(|_| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn open(dir: &TempDir) -> LocalCheckpointManager {
        LocalCheckpointManager::open(LocalCheckpointManagerConfig::new(dir.path()))
            .await
            .unwrap()
    }

    fn meta(step: u64) -> Mapping {
        let mut metadata = Mapping::new();
        metadata.insert("global_step".to_string(), json!(step));
        metadata
    }

    fn ids(checkpoints: &[CheckpointInfo]) -> Vec<&str> {
        checkpoints.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_empty_manager() {
        let dir = tempdir().unwrap();
        let manager = open(&dir).await;

        assert!(manager.list().await.unwrap().is_empty());
        assert!(matches!(
            manager.latest().await,
            Err(Error::CheckpointNotFound { checkpoint_id: None })
        ));
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let manager = open(&dir).await;

        let info = manager
            .save("step-100", Bytes::from_static(b"model-state"), meta(100))
            .await
            .unwrap();
        assert_eq!(info.size_bytes, 11);
        assert_eq!(info.path, dir.path().join("step-100"));

        let loaded = manager.load("step-100").await.unwrap();
        assert_eq!(loaded.payload, Bytes::from_static(b"model-state"));
        assert_eq!(loaded.metadata, meta(100));
        assert_eq!(loaded.created_at, info.created_at);
    }

    #[tokio::test]
    async fn test_load_missing_checkpoint() {
        let dir = tempdir().unwrap();
        let manager = open(&dir).await;

        let result = manager.load("missing").await;
        assert!(matches!(
            result,
            Err(Error::CheckpointNotFound { checkpoint_id: Some(ref id) }) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn test_list_in_creation_order() {
        let dir = tempdir().unwrap();
        let manager = open(&dir).await;

        for id in ["c", "a", "epoch-1/b"] {
            manager.save(id, Bytes::from(id.to_string()), Mapping::new()).await.unwrap();
        }

        let listed = manager.list().await.unwrap();
        assert_eq!(ids(&listed), vec!["c", "a", "epoch-1/b"]);
        assert!(listed.windows(2).all(|w| w[0].created_at < w[1].created_at));

        let latest = manager.latest().await.unwrap();
        assert_eq!(latest.id, "epoch-1/b");
    }

    #[tokio::test]
    async fn test_overwrite_is_atomic_replace() {
        let dir = tempdir().unwrap();
        let manager = open(&dir).await;

        manager.save("best", Bytes::from_static(b"v1"), meta(1)).await.unwrap();
        manager.save("other", Bytes::from_static(b"o"), meta(2)).await.unwrap();
        manager.save("best", Bytes::from_static(b"v2"), meta(3)).await.unwrap();

        let loaded = manager.load("best").await.unwrap();
        assert_eq!(loaded.payload, Bytes::from_static(b"v2"));
        assert_eq!(loaded.metadata, meta(3));
        assert_eq!(ids(&manager.list().await.unwrap()), vec!["other", "best"]);
    }

    #[tokio::test]
    async fn test_abandoned_write_never_visible() {
        let dir = tempdir().unwrap();
        {
            let manager = open(&dir).await;
            manager.save("step-1", Bytes::from_static(b"good"), meta(1)).await.unwrap();
        }

        // A writer killed before the rename leaves only its temp file behind
        let temp = atomic::temp_path_for(&dir.path().join("step-1"));
        std::fs::write(&temp, b"RCKP partial garbage").unwrap();
        let orphan = atomic::temp_path_for(&dir.path().join("step-2"));
        std::fs::write(&orphan, b"RCKP").unwrap();

        let manager = open(&dir).await;
        assert_eq!(ids(&manager.list().await.unwrap()), vec!["step-1"]);
        assert_eq!(
            manager.load("step-1").await.unwrap().payload,
            Bytes::from_static(b"good")
        );
        assert!(matches!(
            manager.load("step-2").await,
            Err(Error::CheckpointNotFound { .. })
        ));
        assert!(!temp.exists());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let manager = open(&dir).await;
        manager.save("run/final", Bytes::from_static(b"old"), meta(1)).await.unwrap();

        // Occupy the destination of a nested id with a directory so the rename fails
        std::fs::create_dir_all(dir.path().join("run/blocked/inner")).unwrap();
        let result = manager
            .save("run/blocked", Bytes::from_static(b"new"), meta(2))
            .await;
        assert!(matches!(result, Err(Error::CheckpointWriteFailed { .. })));

        assert_eq!(ids(&manager.list().await.unwrap()), vec!["run/final"]);
        assert_eq!(
            manager.load("run/final").await.unwrap().payload,
            Bytes::from_static(b"old")
        );
    }

    #[tokio::test]
    async fn test_reopen_restores_order_and_skips_corrupted() {
        let dir = tempdir().unwrap();
        {
            let manager = open(&dir).await;
            manager.save("first", Bytes::from_static(b"1"), meta(1)).await.unwrap();
            manager.save("second", Bytes::from_static(b"2"), meta(2)).await.unwrap();
        }
        std::fs::write(dir.path().join("garbage"), b"not a checkpoint").unwrap();

        let manager = open(&dir).await;
        assert_eq!(ids(&manager.list().await.unwrap()), vec!["first", "second"]);

        // New checkpoints sort after the reopened ones
        manager.save("third", Bytes::from_static(b"3"), meta(3)).await.unwrap();
        assert_eq!(
            ids(&manager.list().await.unwrap()),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn test_validate_checkpoint_id() {
        assert!(validate_checkpoint_id("step-100").is_ok());
        assert!(validate_checkpoint_id("epoch-1/step-100").is_ok());

        for bad in ["", "/abs", "a//b", "../escape", "a/./b", ".hidden", "a\\b", "trailing/"] {
            assert!(
                matches!(
                    validate_checkpoint_id(bad),
                    Err(Error::InvalidCheckpointId { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }
}
