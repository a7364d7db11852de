//! One-call setup of a fully local, durable run

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use run_core::{Mapping, Result, RunSettings, SignalHandler};
use storage::RemoteTransfer;
use tracing::info;

use crate::config_loader::{ConfigLoader, FileConfigLoader, MemoryConfigLoader};
use crate::context::{RunContext, RunScope};
use crate::dataset::{LocalSnapshotFetcher, SnapshotFetcher};
use crate::metrics::LocalMetricSaver;
use crate::model_loader::LocalModelLoader;
use crate::progress::LocalProgressSaver;

/// Where the run configuration comes from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Memory(Mapping),
}

impl Default for ConfigSource {
    fn default() -> Self {
        ConfigSource::Memory(Mapping::new())
    }
}

/// Options for [`local_run_context`]
#[derive(Clone)]
pub struct LocalRunOptions {
    pub run_id: String,
    pub working_dir: PathBuf,
    pub config: ConfigSource,

    /// Defaults to `<working_dir>/model`
    pub model_path: Option<PathBuf>,

    /// Defaults to `<working_dir>/checkpoints`
    pub checkpoint_dir: Option<PathBuf>,

    pub settings: RunSettings,
    pub signals: Option<SignalHandler>,

    /// Defaults to snapshots already under `<working_dir>/datasets`
    pub snapshot_fetcher: Option<Arc<dyn SnapshotFetcher>>,

    /// Needed for `upload_checkpoints`
    pub transfer: Option<Arc<dyn RemoteTransfer>>,
}

impl fmt::Debug for LocalRunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRunOptions")
            .field("run_id", &self.run_id)
            .field("working_dir", &self.working_dir)
            .field("config", &self.config)
            .field("model_path", &self.model_path)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("settings", &self.settings)
            .field("custom_snapshot_fetcher", &self.snapshot_fetcher.is_some())
            .field("transfer", &self.transfer.is_some())
            .finish_non_exhaustive()
    }
}

impl LocalRunOptions {
    pub fn new(run_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            working_dir: working_dir.into(),
            config: ConfigSource::default(),
            model_path: None,
            checkpoint_dir: None,
            settings: RunSettings::default(),
            signals: None,
            snapshot_fetcher: None,
            transfer: None,
        }
    }

    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = ConfigSource::File(path.into());
        self
    }

    pub fn config_mapping(mut self, config: Mapping) -> Self {
        self.config = ConfigSource::Memory(config);
        self
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn signal_handler(mut self, signals: SignalHandler) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn snapshot_fetcher(mut self, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        self.snapshot_fetcher = Some(fetcher);
        self
    }

    pub fn transfer(mut self, transfer: Arc<dyn RemoteTransfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }
}

/// Build a run over the local filesystem and enter it
///
/// Progress and metrics go to durable savers under the working directory,
/// so a later run with the same working directory resumes their history.
/// The returned scope finalizes the run when finished or dropped.
pub async fn local_run_context(options: LocalRunOptions) -> Result<RunScope> {
    let LocalRunOptions {
        run_id,
        working_dir,
        config,
        model_path,
        checkpoint_dir,
        settings,
        signals,
        snapshot_fetcher,
        transfer,
    } = options;

    let config_loader: Arc<dyn ConfigLoader> = match config {
        ConfigSource::File(path) => Arc::new(FileConfigLoader::new(path)),
        ConfigSource::Memory(mapping) => Arc::new(MemoryConfigLoader::new(mapping)),
    };
    let model_path = model_path.unwrap_or_else(|| working_dir.join("model"));

    let flush_threshold = settings.savers.flush_threshold;
    let sync = settings.checkpoint.sync_parent_dir;
    let progress = LocalProgressSaver::open(working_dir.join("progress"), flush_threshold, sync)?;
    let metrics = LocalMetricSaver::open(working_dir.join("metrics"), flush_threshold, sync)?;
    let snapshots = snapshot_fetcher
        .unwrap_or_else(|| Arc::new(LocalSnapshotFetcher::new(working_dir.join("datasets"))));

    let mut builder = RunContext::builder(run_id, working_dir.clone())
        .settings(settings)
        .config_loader(config_loader)
        .model_loader(Arc::new(LocalModelLoader::new(model_path)))
        .progress_saver(Arc::new(progress))
        .metric_saver(Arc::new(metrics))
        .snapshot_fetcher(snapshots);
    if let Some(dir) = checkpoint_dir {
        builder = builder.checkpoint_dir(dir);
    }
    if let Some(signals) = signals {
        builder = builder.signal_handler(signals);
    }
    if let Some(transfer) = transfer {
        builder = builder.transfer(transfer);
    }

    let context = builder.build().await?;
    info!(run_id = %context.run_id(), "Local run context ready");
    context.enter().await
}
