//! Sequenced JSON record files shared by the durable savers
//!
//! Each record lives in `<dir>/<sequence:012>.json` and is written with the
//! atomic replace protocol, so a reader sees whole records or nothing.

use std::path::{Path, PathBuf};

use run_core::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use storage::atomic;
use tracing::warn;

/// Path of record `sequence` in `dir`
pub(crate) fn record_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("{:012}.json", sequence))
}

/// Serialize `record` and atomically write it as record `sequence`
pub(crate) fn write_record<T: Serialize>(
    dir: &Path,
    sequence: u64,
    record: &T,
    sync_parent_dir: bool,
) -> Result<()> {
    let data = serde_json::to_vec(record)?;
    atomic::write_atomic(&record_path(dir, sequence), &data, sync_parent_dir)?;
    Ok(())
}

/// Load every record in `dir`, ordered by sequence
///
/// Leftover temp files are removed first. Files that are not named like a
/// record or fail to parse are skipped with a warning.
pub(crate) fn read_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(u64, T)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    atomic::sweep_temp_files(dir)?;

    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(sequence) = sequence_of(&path) else {
            continue;
        };
        let parsed = std::fs::read(&path)
            .map_err(run_core::Error::from)
            .and_then(|data| serde_json::from_slice::<T>(&data).map_err(Into::into));
        match parsed {
            Ok(record) => records.push((sequence, record)),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }

    records.sort_by_key(|(sequence, _)| *sequence);
    Ok(records)
}

fn sequence_of(path: &Path) -> Option<u64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
