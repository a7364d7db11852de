//! Training metric savers

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use run_core::{Error, MetricRecord, Result};
use tracing::{debug, info, instrument};

use crate::records;

/// Metric persistence capability, one time series per metric name
pub trait MetricSaver: Send + Sync {
    /// Append a point to the series of `record.name`
    fn save(&self, record: MetricRecord) -> Result<()>;

    /// Points recorded under `name`, in save order
    fn series(&self, name: &str) -> Vec<MetricRecord>;

    /// Names with at least one point, sorted
    fn names(&self) -> Vec<String>;

    /// Persist buffered points
    fn flush(&self) -> Result<()>;
}

/// In-memory metric saver
#[derive(Debug, Default)]
pub struct MemoryMetricSaver {
    series: Mutex<BTreeMap<String, Vec<MetricRecord>>>,
}

impl MemoryMetricSaver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricSaver for MemoryMetricSaver {
    fn save(&self, record: MetricRecord) -> Result<()> {
        validate_name(&record.name)?;
        self.series
            .lock()
            .entry(record.name.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn series(&self, name: &str) -> Vec<MetricRecord> {
        self.series.lock().get(name).cloned().unwrap_or_default()
    }

    fn names(&self) -> Vec<String> {
        self.series.lock().keys().cloned().collect()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct LocalState {
    series: BTreeMap<String, Vec<MetricRecord>>,
    next_sequence: HashMap<String, u64>,
    pending: Vec<(u64, MetricRecord)>,
}

/// Durable metric saver writing `<dir>/<encoded-name>/<sequence>.json`
pub struct LocalMetricSaver {
    dir: PathBuf,
    flush_threshold: usize,
    sync_parent_dir: bool,
    state: Mutex<LocalState>,
}

impl LocalMetricSaver {
    /// Open `dir`, reloading every previously persisted series
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, flush_threshold: usize, sync_parent_dir: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut state = LocalState::default();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = decode_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };

            let points = records::read_records::<MetricRecord>(&entry.path())?;
            if let Some((sequence, _)) = points.last() {
                state.next_sequence.insert(name.clone(), sequence + 1);
            }
            state
                .series
                .insert(name, points.into_iter().map(|(_, record)| record).collect());
        }

        if !state.series.is_empty() {
            info!(series = state.series.len(), "Restored metric series");
        }

        Ok(Self {
            dir,
            flush_threshold: flush_threshold.max(1),
            sync_parent_dir,
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of points waiting to be written
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn flush_locked(&self, state: &mut LocalState) -> Result<()> {
        let mut written = 0;
        let mut result = Ok(());
        for (sequence, record) in &state.pending {
            let series_dir = self.dir.join(encode_name(&record.name));
            let write = std::fs::create_dir_all(&series_dir)
                .map_err(Error::from)
                .and_then(|_| {
                    records::write_record(&series_dir, *sequence, record, self.sync_parent_dir)
                });
            if let Err(e) = write {
                result = Err(e);
                break;
            }
            written += 1;
        }
        state.pending.drain(..written);
        if written > 0 {
            debug!(written, remaining = state.pending.len(), "Flushed metric records");
        }
        result
    }
}

impl MetricSaver for LocalMetricSaver {
    fn save(&self, record: MetricRecord) -> Result<()> {
        validate_name(&record.name)?;

        let mut state = self.state.lock();
        let sequence = {
            let next = state.next_sequence.entry(record.name.clone()).or_insert(0);
            let sequence = *next;
            *next += 1;
            sequence
        };
        state
            .series
            .entry(record.name.clone())
            .or_default()
            .push(record.clone());
        state.pending.push((sequence, record));

        if state.pending.len() >= self.flush_threshold {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    fn series(&self, name: &str) -> Vec<MetricRecord> {
        self.state.lock().series.get(name).cloned().unwrap_or_default()
    }

    fn names(&self) -> Vec<String> {
        self.state.lock().series.keys().cloned().collect()
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }
}

/// Metric name as a single path segment
///
/// Percent-encodes everything but unreserved characters; a leading `.` is
/// encoded too so the segment never looks like `..` or a temp file.
/// Every saver rejects empty metric names
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidMetricName {
            name: name.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

pub fn encode_name(name: &str) -> String {
    let encoded = urlencoding::encode(name);
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded.into_owned(),
    }
}

/// Inverse of [`encode_name`]
pub fn decode_name(segment: &str) -> Option<String> {
    urlencoding::decode(segment).ok().map(|name| name.into_owned())
}
