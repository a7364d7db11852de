//! Dataset snapshot materialization
//!
//! A snapshot is an immutable directory under the run's dataset root. The
//! local fetcher expects it to be there already; the remote fetcher downloads
//! it through a [`RemoteTransfer`] into a hidden staging directory and renames
//! it into place, so a half-downloaded snapshot is never visible.
//!
//! A [`SnapshotSplit`] indexes one split of a materialized snapshot for
//! random access to its datums.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use run_core::{DatasetSnapshot, Error, Mapping, Result};
use serde_json::{json, Value};
use storage::RemoteTransfer;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// File describing a snapshot, used verbatim as its manifest when present
pub const MANIFEST_FILE: &str = "manifest.json";

/// Snapshot resolution capability
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Materialize `snapshot_id` on local disk
    async fn fetch(&self, snapshot_id: &str) -> Result<DatasetSnapshot>;
}

/// Snapshots already present under `<root>/<snapshot_id>`
#[derive(Debug, Clone)]
pub struct LocalSnapshotFetcher {
    root: PathBuf,
}

impl LocalSnapshotFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch `snapshot_id` and index one of its splits
    pub async fn prepare_split(&self, snapshot_id: &str, split: Option<&str>) -> Result<SnapshotSplit> {
        let snapshot = self.fetch(snapshot_id).await?;
        SnapshotSplit::open(&snapshot, split).await
    }
}

#[async_trait]
impl SnapshotFetcher for LocalSnapshotFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, snapshot_id: &str) -> Result<DatasetSnapshot> {
        validate_snapshot_id(snapshot_id)?;
        let local_path = self.root.join(snapshot_id);

        match fs::metadata(&local_path).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => {
                return Err(fetch_error(
                    snapshot_id,
                    format!("no snapshot directory at {}", local_path.display()),
                ))
            }
        }

        let manifest = build_manifest(snapshot_id, &local_path).await?;
        Ok(DatasetSnapshot {
            snapshot_id: snapshot_id.to_string(),
            local_path,
            manifest,
        })
    }
}

/// Snapshots downloaded from `<remote_prefix><snapshot_id>/`
pub struct RemoteSnapshotFetcher {
    transfer: Arc<dyn RemoteTransfer>,
    remote_prefix: String,
    root: PathBuf,
}

impl RemoteSnapshotFetcher {
    /// `remote_prefix` is either empty or ends with `/`
    pub fn new(
        transfer: Arc<dyn RemoteTransfer>,
        remote_prefix: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transfer,
            remote_prefix: remote_prefix.into(),
            root: root.into(),
        }
    }

    async fn download(&self, snapshot_id: &str, local_path: &Path) -> Result<()> {
        fs::create_dir_all(&self.root).await?;

        let staging = self
            .root
            .join(format!(".{}.{}.staging", snapshot_id, uuid::Uuid::new_v4()));
        let remote = format!("{}{}/", self.remote_prefix, snapshot_id);

        let result = async {
            let count = self.transfer.download(&remote, &staging).await?;
            if count == 0 {
                return Err(Error::storage(format!("nothing stored under {}", remote)));
            }
            fs::rename(&staging, local_path).await?;
            Ok::<usize, Error>(count)
        }
        .await;

        match result {
            Ok(count) => {
                info!(%snapshot_id, files = count, path = %local_path.display(), "Snapshot downloaded");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging directory");
                    }
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SnapshotFetcher for RemoteSnapshotFetcher {
    #[instrument(skip(self), fields(prefix = %self.remote_prefix))]
    async fn fetch(&self, snapshot_id: &str) -> Result<DatasetSnapshot> {
        validate_snapshot_id(snapshot_id)?;
        let local_path = self.root.join(snapshot_id);

        if fs::metadata(&local_path).await.is_ok() {
            debug!(%snapshot_id, "Snapshot already materialized");
        } else {
            self.download(snapshot_id, &local_path)
                .await
                .map_err(|e| match e {
                    Error::SnapshotFetch { .. } => e,
                    other => fetch_error(snapshot_id, other.to_string()),
                })?;
        }

        let manifest = build_manifest(snapshot_id, &local_path).await?;
        Ok(DatasetSnapshot {
            snapshot_id: snapshot_id.to_string(),
            local_path,
            manifest,
        })
    }
}

/// One datum with the mapping from its `<id>.json` sidecar
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    pub id: String,
    pub data: Bytes,
    pub metadata: Mapping,
}

/// Indexed view over one split of a materialized snapshot
///
/// Each datum is a file `<id>` next to its sidecar `<id>.json` in
/// `<snapshot>/<split>/`. Datums are indexed in id order. Without a split the
/// snapshot directory itself is indexed, minus its manifest.
#[derive(Debug, Clone)]
pub struct SnapshotSplit {
    snapshot_id: String,
    split: Option<String>,
    dir: PathBuf,
    datum_ids: Vec<String>,
}

impl SnapshotSplit {
    #[instrument(skip(snapshot), fields(snapshot_id = %snapshot.snapshot_id))]
    pub async fn open(snapshot: &DatasetSnapshot, split: Option<&str>) -> Result<Self> {
        let snapshot_id = snapshot.snapshot_id.as_str();
        let dir = match split {
            Some(split) if is_plain_segment(split) => snapshot.local_path.join(split),
            Some(split) => return Err(fetch_error(snapshot_id, format!("invalid split {:?}", split))),
            None => snapshot.local_path.clone(),
        };

        let mut entries = fs::read_dir(&dir).await.map_err(|e| {
            fetch_error(snapshot_id, format!("cannot read split directory {}: {}", dir.display(), e))
        })?;
        let mut datum_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MANIFEST_FILE || name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                datum_ids.push(id.to_string());
            }
        }
        datum_ids.sort();

        debug!(?split, num_datums = datum_ids.len(), "Prepared snapshot split");
        Ok(Self {
            snapshot_id: snapshot_id.to_string(),
            split: split.map(String::from),
            dir,
            datum_ids,
        })
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn split(&self) -> Option<&str> {
        self.split.as_deref()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn num_datums(&self) -> usize {
        self.datum_ids.len()
    }

    pub fn datum_ids(&self) -> &[String] {
        &self.datum_ids
    }

    /// Read the datum at `index` and its metadata
    pub async fn datum_at(&self, index: usize) -> Result<Datum> {
        let id = self
            .datum_ids
            .get(index)
            .ok_or_else(|| Error::DatumIndexOutOfRange {
                index,
                num_datums: self.num_datums(),
            })?;

        let data = fs::read(self.dir.join(id))
            .await
            .map_err(|e| fetch_error(&self.snapshot_id, format!("cannot read datum {}: {}", id, e)))?;
        let sidecar = fs::read(self.dir.join(format!("{}.json", id)))
            .await
            .map_err(|e| fetch_error(&self.snapshot_id, format!("cannot read metadata of {}: {}", id, e)))?;
        let metadata = match serde_json::from_slice::<Value>(&sidecar) {
            Ok(Value::Object(metadata)) => metadata,
            Ok(_) => return Err(fetch_error(&self.snapshot_id, format!("metadata of {} is not a mapping", id))),
            Err(e) => return Err(fetch_error(&self.snapshot_id, format!("malformed metadata of {}: {}", id, e))),
        };

        Ok(Datum {
            id: id.clone(),
            data: Bytes::from(data),
            metadata,
        })
    }
}

/// Snapshot ids are single, non-hidden path segments
pub fn validate_snapshot_id(snapshot_id: &str) -> Result<()> {
    if is_plain_segment(snapshot_id) {
        Ok(())
    } else {
        Err(fetch_error(snapshot_id, "invalid snapshot id"))
    }
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.starts_with('.') && !segment.contains(['/', '\\', '\0'])
}

fn fetch_error(snapshot_id: &str, message: impl Into<String>) -> Error {
    Error::SnapshotFetch {
        snapshot_id: snapshot_id.to_string(),
        message: message.into(),
    }
}

/// Read `manifest.json`, or describe the files of the snapshot
async fn build_manifest(snapshot_id: &str, dir: &Path) -> Result<Mapping> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if let Ok(data) = fs::read(&manifest_path).await {
        return match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Object(manifest)) => Ok(manifest),
            Ok(_) => Err(fetch_error(snapshot_id, "manifest.json is not a mapping")),
            Err(e) => Err(fetch_error(snapshot_id, format!("malformed manifest.json: {}", e))),
        };
    }

    let mut files = Vec::new();
    let mut total_bytes = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else if let Ok(relative) = entry.path().strip_prefix(dir) {
                total_bytes += metadata.len();
                files.push(
                    relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                );
            }
        }
    }
    files.sort();

    let mut manifest = Mapping::new();
    manifest.insert("snapshot_id".to_string(), json!(snapshot_id));
    manifest.insert("file_count".to_string(), json!(files.len()));
    manifest.insert("total_bytes".to_string(), json!(total_bytes));
    manifest.insert("files".to_string(), json!(files));
    Ok(manifest)
}
