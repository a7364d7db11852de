//! Atomic file replacement
//!
//! Write-to-temp, sync, rename-into-place. The temporary file lives next to
//! the destination so the rename never crosses a filesystem; a reader sees
//! either the previous file or the complete new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use run_core::{Error, Result};
use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_SUFFIX: &str = ".tmp";

/// Unique temporary sibling of `dest` (`.<name>.<uuid>.tmp`)
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}{}",
        dest.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4(),
        TEMP_SUFFIX
    );
    dest.with_file_name(temp_name)
}

/// Whether a file name belongs to an unfinished atomic write
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Fsync a directory so a completed rename survives a crash
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Atomically replace `dest` with `data`
///
/// Parent directories are created as needed. On failure the temporary file is
/// removed and `dest` keeps its previous content.
pub fn write_atomic(dest: &Path, data: &[u8], sync_parent: bool) -> Result<u64> {
    let parent = dest.parent().ok_or_else(|| Error::Storage {
        message: format!("Destination has no parent directory: {}", dest.display()),
    })?;
    fs::create_dir_all(parent).map_err(|e| Error::Storage {
        message: format!("Failed to create directory {:?}: {}", parent, e),
    })?;

    let temp_path = temp_path_for(dest);
    debug!(?dest, ?temp_path, size = data.len(), "Writing file atomically");

    if let Err(e) = write_and_sync(&temp_path, data) {
        discard_temp(&temp_path);
        return Err(Error::Storage {
            message: format!("Failed to write temp file {:?}: {}", temp_path, e),
        });
    }

    if let Err(e) = fs::rename(&temp_path, dest) {
        discard_temp(&temp_path);
        return Err(Error::Storage {
            message: format!("Failed to rename {:?} to {:?}: {}", temp_path, dest, e),
        });
    }

    if sync_parent {
        if let Err(e) = sync_dir(parent) {
            warn!(dir = ?parent, error = %e, "Failed to sync directory after rename");
        }
    }

    Ok(data.len() as u64)
}

/// Remove temporary files left behind by interrupted writers in `dir`
///
/// Returns how many were removed. Missing directories count as clean.
pub fn sweep_temp_files(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_temp_file(&name) && entry.path().is_file() {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %name, error = %e, "Failed to remove stale temp file"),
            }
        }
    }
    if removed > 0 {
        debug!(?dir, removed, "Removed stale temp files");
    }
    Ok(removed)
}

fn write_and_sync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()
}

fn discard_temp(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(?path, error = %e, "Failed to remove temp file"),
    }
}
