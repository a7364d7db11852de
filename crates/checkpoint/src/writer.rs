//! Checkpoint file codec and atomic writer
//!
//! File layout (little endian):
//!
//! | field           | size            |
//! |-----------------|-----------------|
//! | magic `RCKP`    | 4               |
//! | version         | 4 (`u32`)       |
//! | created_at (µs) | 8 (`i64`)       |
//! | metadata length | 4 (`u32`)       |
//! | metadata JSON   | metadata length |
//! | payload length  | 8 (`u64`)       |
//! | payload         | payload length  |

use std::io::Read;
use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use run_core::{CheckpointRecord, Error, Mapping, Result};
use storage::atomic;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"RCKP";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Bytes before the metadata JSON: magic, version, created_at, metadata length
const FIXED_PREFIX_LEN: usize = 4 + 4 + 8 + 4;

/// Decoded checkpoint header
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub metadata: Mapping,
    pub payload_len: u64,

    /// Total header size; the payload starts at this offset
    pub header_len: u64,
}

/// Writes checkpoint files with the temp-sync-rename protocol
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    sync_parent_dir: bool,
}

impl CheckpointWriter {
    pub fn new(sync_parent_dir: bool) -> Self {
        Self { sync_parent_dir }
    }

    /// Atomically write `record` to `dest`
    ///
    /// 1. encode into a temp file next to `dest`
    /// 2. write, flush and fsync it
    /// 3. rename it over `dest`
    ///
    /// Any failure before the rename removes the temp file and leaves `dest`
    /// untouched. Returns the number of bytes written.
    #[instrument(skip(self, record), fields(checkpoint_id = %record.id, size = record.payload.len()))]
    pub async fn write(&self, dest: &Path, record: &CheckpointRecord) -> Result<u64> {
        let start = Instant::now();
        let encoded = encode(record)?;

        let parent = dest.parent().ok_or_else(|| write_failed(&record.id, "destination has no parent"))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| write_failed(&record.id, format!("failed to create {:?}: {}", parent, e)))?;

        let temp_path = atomic::temp_path_for(dest);
        debug!(?temp_path, ?dest, "Writing checkpoint to temp file");

        if let Err(e) = write_temp_and_rename(&temp_path, dest, &encoded).await {
            discard_temp(&temp_path).await;
            return Err(write_failed(&record.id, e.to_string()));
        }

        if self.sync_parent_dir {
            let dir = parent.to_path_buf();
            match tokio::task::spawn_blocking(move || atomic::sync_dir(&dir)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(dir = ?parent, error = %e, "Failed to sync checkpoint directory"),
                Err(e) => warn!(dir = ?parent, error = %e, "Directory sync task failed"),
            }
        }

        let size = encoded.len() as u64;
        let elapsed = start.elapsed();
        info!(
            checkpoint_id = %record.id,
            size_bytes = size,
            elapsed_ms = elapsed.as_millis(),
            throughput_mbps = (size as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON),
            "Checkpoint write complete"
        );

        Ok(size)
    }

    /// Read and decode the checkpoint stored at `path`
    ///
    /// Only a regular file is a checkpoint. A directory of nested checkpoints,
    /// or a path running through an existing file, is reported as not found.
    pub async fn read(id: &str, path: &Path) -> Result<CheckpointRecord> {
        let not_found = || Error::CheckpointNotFound {
            checkpoint_id: Some(id.to_string()),
        };
        if !is_regular_file(path).await? {
            return Err(not_found());
        }

        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(Error::Io(e)),
        };
        decode(id, &data)
    }

    /// Read only the header of the checkpoint at `path`, checking the file length
    pub fn read_header(id: &str, path: &Path) -> Result<CheckpointHeader> {
        let mut file = std::fs::File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut prefix = [0u8; FIXED_PREFIX_LEN];
        file.read_exact(&mut prefix)
            .map_err(|_| corrupted(id, "truncated header"))?;
        let (version, created_at, meta_len) = parse_prefix(id, &prefix)?;

        let header_len = (FIXED_PREFIX_LEN + meta_len + 8) as u64;
        if header_len > file_len {
            return Err(corrupted(
                id,
                format!("metadata length {} exceeds file size {}", meta_len, file_len),
            ));
        }

        let mut meta = vec![0u8; meta_len];
        file.read_exact(&mut meta)
            .map_err(|_| corrupted(id, "truncated metadata"))?;
        let mut payload_len = [0u8; 8];
        file.read_exact(&mut payload_len)
            .map_err(|_| corrupted(id, "truncated header"))?;
        let payload_len = u64::from_le_bytes(payload_len);

        if file_len - header_len != payload_len {
            return Err(corrupted(
                id,
                format!("expected {} bytes, found {}", header_len + payload_len, file_len),
            ));
        }

        Ok(CheckpointHeader {
            version,
            created_at,
            metadata: parse_metadata(id, &meta)?,
            payload_len,
            header_len,
        })
    }
}

impl Default for CheckpointWriter {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Encode a checkpoint record into its file representation
pub fn encode(record: &CheckpointRecord) -> Result<Vec<u8>> {
    let metadata = serde_json::to_vec(&record.metadata)?;
    let meta_len = u32::try_from(metadata.len()).map_err(|_| {
        write_failed(&record.id, format!("metadata too large: {} bytes", metadata.len()))
    })?;

    let mut buf = Vec::with_capacity(FIXED_PREFIX_LEN + metadata.len() + 8 + record.payload.len());
    buf.extend_from_slice(&CHECKPOINT_MAGIC);
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    buf.extend_from_slice(&record.created_at.timestamp_micros().to_le_bytes());
    buf.extend_from_slice(&meta_len.to_le_bytes());
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(&(record.payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(&record.payload);
    Ok(buf)
}

/// Decode a checkpoint file
pub fn decode(id: &str, data: &[u8]) -> Result<CheckpointRecord> {
    if data.len() < FIXED_PREFIX_LEN {
        return Err(corrupted(id, "truncated header"));
    }
    let (_, created_at, meta_len) = parse_prefix(id, &data[..FIXED_PREFIX_LEN])?;

    let meta_end = FIXED_PREFIX_LEN + meta_len;
    let payload_start = meta_end + 8;
    if data.len() < payload_start {
        return Err(corrupted(id, "truncated metadata"));
    }
    let metadata = parse_metadata(id, &data[FIXED_PREFIX_LEN..meta_end])?;

    let payload_len = u64::from_le_bytes(read_array(&data[meta_end..payload_start]));
    let available = (data.len() - payload_start) as u64;
    if available != payload_len {
        return Err(corrupted(
            id,
            format!("expected {} payload bytes, found {}", payload_len, available),
        ));
    }

    Ok(CheckpointRecord {
        id: id.to_string(),
        payload: Bytes::copy_from_slice(&data[payload_start..]),
        metadata,
        created_at,
    })
}

fn parse_prefix(id: &str, prefix: &[u8]) -> Result<(u32, DateTime<Utc>, usize)> {
    if prefix[..4] != CHECKPOINT_MAGIC {
        return Err(corrupted(id, "invalid checkpoint magic"));
    }

    let version = u32::from_le_bytes(read_array(&prefix[4..8]));
    if version != CHECKPOINT_VERSION {
        return Err(corrupted(id, format!("unsupported version {}", version)));
    }

    let micros = i64::from_le_bytes(read_array(&prefix[8..16]));
    let created_at = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| corrupted(id, format!("invalid timestamp {}", micros)))?;

    let meta_len = u32::from_le_bytes(read_array(&prefix[16..20])) as usize;
    Ok((version, created_at, meta_len))
}

fn parse_metadata(id: &str, raw: &[u8]) -> Result<Mapping> {
    serde_json::from_slice(raw).map_err(|e| corrupted(id, format!("invalid metadata: {}", e)))
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

async fn write_temp_and_rename(temp_path: &Path, dest: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(temp_path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(temp_path, dest).await
}

async fn is_regular_file(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            // ENOTDIR: the closest existing ancestor is a file
            for ancestor in path.ancestors().skip(1) {
                if let Ok(metadata) = fs::metadata(ancestor).await {
                    if !metadata.is_dir() {
                        return Ok(false);
                    }
                    break;
                }
            }
            Err(Error::Io(e))
        }
    }
}

async fn discard_temp(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(?path, "Removed temp file after failed write"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(?path, error = %e, "Failed to remove temp file"),
    }
}

fn write_failed(id: &str, message: impl Into<String>) -> Error {
    Error::CheckpointWriteFailed {
        checkpoint_id: id.to_string(),
        message: message.into(),
    }
}

fn corrupted(id: &str, reason: impl Into<String>) -> Error {
    Error::CheckpointCorrupted {
        checkpoint_id: id.to_string(),
        reason: reason.into(),
    }
}
