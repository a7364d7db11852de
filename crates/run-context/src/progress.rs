//! Training progress savers

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use run_core::{ProgressRecord, Result};
use tracing::{debug, info, instrument};

use crate::records;

/// Progress persistence capability
pub trait ProgressSaver: Send + Sync {
    /// Record a progress update
    fn save(&self, record: ProgressRecord) -> Result<()>;

    /// Most recently saved record
    fn latest(&self) -> Option<ProgressRecord>;

    /// Every saved record, oldest first
    fn history(&self) -> Vec<ProgressRecord>;

    /// Persist buffered records
    fn flush(&self) -> Result<()>;
}

/// In-memory progress saver
#[derive(Debug, Default)]
pub struct MemoryProgressSaver {
    records: Mutex<Vec<ProgressRecord>>,
}

impl MemoryProgressSaver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSaver for MemoryProgressSaver {
    fn save(&self, record: ProgressRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    fn latest(&self) -> Option<ProgressRecord> {
        self.records.lock().last().cloned()
    }

    fn history(&self) -> Vec<ProgressRecord> {
        self.records.lock().clone()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct LocalState {
    history: Vec<ProgressRecord>,
    /// Records not yet on disk, with their cursor
    pending: Vec<(u64, ProgressRecord)>,
    next_cursor: u64,
}

/// Durable progress saver writing `<dir>/<cursor>.json`
///
/// Records are buffered and written once `flush_threshold` accumulate, on
/// [`flush`](ProgressSaver::flush), and by the run's finalize hook.
pub struct LocalProgressSaver {
    dir: PathBuf,
    flush_threshold: usize,
    sync_parent_dir: bool,
    state: Mutex<LocalState>,
}

impl LocalProgressSaver {
    /// Open `dir`, reloading previously persisted progress
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, flush_threshold: usize, sync_parent_dir: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let existing = records::read_records::<ProgressRecord>(&dir)?;
        let next_cursor = existing.last().map(|(cursor, _)| cursor + 1).unwrap_or(0);
        let history: Vec<_> = existing.into_iter().map(|(_, record)| record).collect();
        if !history.is_empty() {
            info!(records = history.len(), "Restored progress history");
        }

        Ok(Self {
            dir,
            flush_threshold: flush_threshold.max(1),
            sync_parent_dir,
            state: Mutex::new(LocalState {
                history,
                pending: Vec::new(),
                next_cursor,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of records waiting to be written
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn flush_locked(&self, state: &mut LocalState) -> Result<()> {
        let mut written = 0;
        let mut result = Ok(());
        for (cursor, record) in &state.pending {
            if let Err(e) = records::write_record(&self.dir, *cursor, record, self.sync_parent_dir) {
                result = Err(e);
                break;
            }
            written += 1;
        }
        state.pending.drain(..written);
        if written > 0 {
            debug!(written, remaining = state.pending.len(), "Flushed progress records");
        }
        result
    }
}

impl ProgressSaver for LocalProgressSaver {
    fn save(&self, record: ProgressRecord) -> Result<()> {
        let mut state = self.state.lock();
        let cursor = state.next_cursor;
        state.next_cursor += 1;
        state.history.push(record.clone());
        state.pending.push((cursor, record));

        if state.pending.len() >= self.flush_threshold {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    fn latest(&self) -> Option<ProgressRecord> {
        self.state.lock().history.last().cloned()
    }

    fn history(&self) -> Vec<ProgressRecord> {
        self.state.lock().history.clone()
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }
}
