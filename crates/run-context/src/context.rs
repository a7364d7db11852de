//! Run context: composes the run's backends and drives its lifecycle
//!
//! ```text
//! Created --enter--> Active --finish/drop--> Completed | Interrupted | Failed
//! ```
//!
//! Entering a [`RunContext`] yields a [`RunScope`]. Closing the scope, through
//! [`RunScope::finish`], [`RunScope::run`] or by dropping it, performs exactly
//! one finalize pass: registered hooks run (newest first), buffered progress
//! and metrics are flushed, and the terminal state is written to `run.json`.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use checkpoint::{
    CheckpointManagerHandle, LocalCheckpointManager, LocalCheckpointManagerConfig,
};
use parking_lot::Mutex;
use run_core::{
    CheckpointInfo, CheckpointRecord, DatasetSnapshot, Epoch, Error, Mapping, MetricRecord,
    ProgressRecord, Result, RunIdentity, RunSettings, RunState, RunStatus, SignalHandler,
    SignalListener, Step,
};
use serde::de::DeserializeOwned;
use storage::{atomic, RemoteTransfer};
use tracing::{debug, error, info, instrument, warn};

use crate::config_loader::{ConfigLoader, MemoryConfigLoader};
use crate::dataset::{LocalSnapshotFetcher, SnapshotFetcher, SnapshotSplit};
use crate::metrics::{MemoryMetricSaver, MetricSaver};
use crate::model_loader::{LocalModelLoader, ModelHandle, ModelLoader};
use crate::progress::{MemoryProgressSaver, ProgressSaver};

/// Status file under the working directory
pub const STATUS_FILE: &str = "run.json";

const FINALIZE_HOOK: &str = "run-context-finalize";

/// Builder for [`RunContext`]
pub struct RunContextBuilder {
    run_id: String,
    working_dir: PathBuf,
    settings: RunSettings,
    signals: Option<SignalHandler>,
    config_loader: Option<Arc<dyn ConfigLoader>>,
    model_loader: Option<Arc<dyn ModelLoader>>,
    checkpoint_manager: Option<CheckpointManagerHandle>,
    checkpoint_dir: Option<PathBuf>,
    progress_saver: Option<Arc<dyn ProgressSaver>>,
    metric_saver: Option<Arc<dyn MetricSaver>>,
    snapshot_fetcher: Option<Arc<dyn SnapshotFetcher>>,
    transfer: Option<Arc<dyn RemoteTransfer>>,
}

impl RunContextBuilder {
    fn new(run_id: String, working_dir: PathBuf) -> Self {
        Self {
            run_id,
            working_dir,
            settings: RunSettings::default(),
            signals: None,
            config_loader: None,
            model_loader: None,
            checkpoint_manager: None,
            checkpoint_dir: None,
            progress_saver: None,
            metric_saver: None,
            snapshot_fetcher: None,
            transfer: None,
        }
    }

    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share an existing handler instead of creating one
    pub fn signal_handler(mut self, signals: SignalHandler) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn config_loader(mut self, loader: Arc<dyn ConfigLoader>) -> Self {
        self.config_loader = Some(loader);
        self
    }

    pub fn model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.model_loader = Some(loader);
        self
    }

    pub fn checkpoint_manager(mut self, manager: CheckpointManagerHandle) -> Self {
        self.checkpoint_manager = Some(manager);
        self
    }

    /// Directory of the default checkpoint manager and of
    /// [`RunContext::upload_checkpoints`]; defaults to `<working_dir>/checkpoints`
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn progress_saver(mut self, saver: Arc<dyn ProgressSaver>) -> Self {
        self.progress_saver = Some(saver);
        self
    }

    pub fn metric_saver(mut self, saver: Arc<dyn MetricSaver>) -> Self {
        self.metric_saver = Some(saver);
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

    /// Build the context, filling unset backends with defaults
    ///
    /// Opens the default local checkpoint manager if none was supplied.
    pub async fn build(self) -> Result<RunContext> {
        self.settings.validate()?;

        let working_dir = self.working_dir;
        let checkpoint_dir = self
            .checkpoint_dir
            .unwrap_or_else(|| working_dir.join("checkpoints"));

        let checkpoints = match self.checkpoint_manager {
            Some(manager) => manager,
            None => {
                let config = LocalCheckpointManagerConfig {
                    base_path: checkpoint_dir.clone(),
                    sync_parent_dir: self.settings.checkpoint.sync_parent_dir,
                };
                Arc::new(LocalCheckpointManager::open(config).await?)
            }
        };

        let inner = Inner {
            identity: RunIdentity::new(self.run_id, working_dir.clone()),
            signals: self.signals.unwrap_or_default(),
            config_loader: self
                .config_loader
                .unwrap_or_else(|| Arc::new(MemoryConfigLoader::default())),
            model_loader: self
                .model_loader
                .unwrap_or_else(|| Arc::new(LocalModelLoader::new(working_dir.join("model")))),
            checkpoints,
            checkpoint_dir,
            progress: self
                .progress_saver
                .unwrap_or_else(|| Arc::new(MemoryProgressSaver::new())),
            metrics: self
                .metric_saver
                .unwrap_or_else(|| Arc::new(MemoryMetricSaver::new())),
            snapshots: self
                .snapshot_fetcher
                .unwrap_or_else(|| Arc::new(LocalSnapshotFetcher::new(working_dir.join("datasets")))),
            transfer: self.transfer,
            lifecycle: Mutex::new(Lifecycle {
                state: RunState::Created,
                updated_at: Utc::now(),
                error: None,
            }),
            config_cache: Mutex::new(None),
            snapshot_cache: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            settings: self.settings,
        };

        Ok(RunContext {
            inner: Arc::new(inner),
        })
    }
}

struct Lifecycle {
    state: RunState,
    updated_at: DateTime<Utc>,
    error: Option<String>,
}

struct Inner {
    identity: RunIdentity,
    settings: RunSettings,
    signals: SignalHandler,
    config_loader: Arc<dyn ConfigLoader>,
    model_loader: Arc<dyn ModelLoader>,
    checkpoints: CheckpointManagerHandle,
    checkpoint_dir: PathBuf,
    progress: Arc<dyn ProgressSaver>,
    metrics: Arc<dyn MetricSaver>,
    snapshots: Arc<dyn SnapshotFetcher>,
    transfer: Option<Arc<dyn RemoteTransfer>>,
    lifecycle: Mutex<Lifecycle>,
    config_cache: Mutex<Option<Mapping>>,
    snapshot_cache: Mutex<HashMap<String, DatasetSnapshot>>,
    listener: Mutex<Option<SignalListener>>,
}

impl Inner {
    fn status_path(&self) -> PathBuf {
        self.identity.working_dir.join(STATUS_FILE)
    }

    fn status(&self) -> RunStatus {
        let lifecycle = self.lifecycle.lock();
        RunStatus {
            run_id: self.identity.run_id.clone(),
            state: lifecycle.state,
            created_at: self.identity.created_at,
            updated_at: lifecycle.updated_at,
            error: lifecycle.error.clone(),
        }
    }

    fn write_status(&self, status: &RunStatus) -> Result<()> {
        let data = serde_json::to_vec_pretty(status)?;
        atomic::write_atomic(
            &self.status_path(),
            &data,
            self.settings.checkpoint.sync_parent_dir,
        )?;
        Ok(())
    }

    fn transition(&self, next: RunState, error: Option<String>) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.state.can_transition_to(next) {
                return Err(Error::InvalidStateTransition {
                    from: lifecycle.state.to_string(),
                    to: next.to_string(),
                });
            }
            lifecycle.state = next;
            lifecycle.updated_at = Utc::now();
            lifecycle.error = error;
        }
        info!(run_id = %self.identity.run_id, state = %next, "Run state changed");
        self.write_status(&self.status())
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.lifecycle.lock().state;
        if state == RunState::Active {
            Ok(())
        } else {
            Err(Error::RunNotActive {
                run_id: self.identity.run_id.clone(),
                state: state.to_string(),
            })
        }
    }

    /// Flush both savers, attempting each even if the other fails
    fn flush_savers(&self) -> Result<()> {
        let progress = self.progress.flush();
        let metrics = self.metrics.flush();
        progress.and(metrics)
    }

    /// Body of the finalize hook registered on enter
    fn on_finalize(&self) -> Result<()> {
        let flushed = self.flush_savers();

        if self.signals.is_interrupted() {
            // The terminal transition happens when the scope closes; leave an
            // on-disk marker in case the process does not get that far.
            let mut status = self.status();
            if status.state == RunState::Active {
                status.state = RunState::Interrupted;
                status.updated_at = Utc::now();
                self.write_status(&status)?;
                warn!(run_id = %self.identity.run_id, "Run marked as interrupted");
            }
        }
        flushed
    }

    fn finalize(&self, terminal: RunState, error: Option<String>) -> Result<()> {
        let hooks = self.signals.run_hooks();
        debug!(hooks, "Finalize pass ran hooks");

        // Records saved after a signal-triggered pass are still buffered
        if let Err(e) = self.flush_savers() {
            error!(error = %e, "Failed to flush savers during finalize");
        }

        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }

        let current = self.lifecycle.lock().state;
        if current.is_terminal() {
            debug!(state = %current, "Run already finalized");
            return Ok(());
        }
        self.transition(terminal, error)
    }
}

/// Orchestrator for one training run
///
/// Cloning yields another handle to the same run.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<Inner>,
}

impl RunContext {
    pub fn builder(run_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> RunContextBuilder {
        RunContextBuilder::new(run_id.into(), working_dir.into())
    }

    /// Activate the run
    ///
    /// Creates the working directory, registers the finalize hook, installs
    /// the OS signal listener (per [`RunSettings`]) and writes `run.json`.
    #[instrument(skip(self), fields(run_id = %self.inner.identity.run_id))]
    pub async fn enter(&self) -> Result<RunScope> {
        {
            let state = self.inner.lifecycle.lock().state;
            if !state.can_transition_to(RunState::Active) {
                return Err(Error::InvalidStateTransition {
                    from: state.to_string(),
                    to: RunState::Active.to_string(),
                });
            }
        }

        let working_dir = &self.inner.identity.working_dir;
        tokio::fs::create_dir_all(working_dir).await?;

        if let Ok(previous) = tokio::fs::read(self.inner.status_path()).await {
            if let Ok(status) = serde_json::from_slice::<RunStatus>(&previous) {
                info!(previous_state = %status.state, "Resuming run in existing working directory");
            }
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.signals.register(FINALIZE_HOOK, move || match weak.upgrade() {
            Some(inner) => inner.on_finalize(),
            None => Ok(()),
        });

        if self.inner.settings.signals.install {
            let listener = self.inner.signals.install()?;
            *self.inner.listener.lock() = Some(listener);
        }

        self.inner.transition(RunState::Active, None)?;
        info!(working_dir = %working_dir.display(), "Run started");

        Ok(RunScope {
            context: self.clone(),
            finished: false,
        })
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.inner.identity
    }

    pub fn run_id(&self) -> &str {
        &self.inner.identity.run_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.inner.identity.working_dir
    }

    pub fn state(&self) -> RunState {
        self.inner.lifecycle.lock().state
    }

    /// Current status, as written to `run.json`
    pub fn status(&self) -> RunStatus {
        self.inner.status()
    }

    pub fn settings(&self) -> &RunSettings {
        &self.inner.settings
    }

    pub fn signal_handler(&self) -> &SignalHandler {
        &self.inner.signals
    }

    /// Whether an interruption was received; training loops poll this
    pub fn is_interrupted(&self) -> bool {
        self.inner.signals.is_interrupted()
    }

    /// Register a finalize hook, run before the context's own flush
    pub fn register_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.inner.signals.register(name, hook);
    }

    /// Run configuration, loaded on first call and cached
    pub fn load_config(&self) -> Result<Mapping> {
        let mut cache = self.inner.config_cache.lock();
        if let Some(config) = cache.as_ref() {
            return Ok(config.clone());
        }
        let config = self.inner.config_loader.load()?;
        debug!(keys = config.len(), "Configuration cached");
        *cache = Some(config.clone());
        Ok(config)
    }

    /// Run configuration deserialized into `T`
    pub fn load_config_as<T: DeserializeOwned>(&self) -> Result<T> {
        let config = self.load_config()?;
        serde_json::from_value(serde_json::Value::Object(config))
            .map_err(|e| Error::config(format!("configuration does not match: {}", e)))
    }

    /// Drop the cached configuration; the next load asks the loader again
    pub fn invalidate_config(&self) {
        self.inner.config_cache.lock().take();
    }

    pub fn load_model(&self) -> Result<ModelHandle> {
        self.inner.model_loader.load()
    }

    pub async fn save_checkpoint(
        &self,
        id: &str,
        payload: impl Into<Bytes>,
        metadata: Mapping,
    ) -> Result<CheckpointInfo> {
        self.inner.ensure_active()?;
        self.inner.checkpoints.save(id, payload.into(), metadata).await
    }

    pub async fn load_checkpoint(&self, id: &str) -> Result<CheckpointRecord> {
        self.inner.checkpoints.load(id).await
    }

    /// Most recently created checkpoint
    pub async fn latest_checkpoint(&self) -> Result<CheckpointRecord> {
        self.inner.checkpoints.latest().await
    }

    /// Checkpoints, oldest first
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        self.inner.checkpoints.list().await
    }

    pub fn save_progress(&self, epoch: Epoch, step: Step, extra: Mapping) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.progress.save(ProgressRecord::new(epoch, step, extra))
    }

    pub fn latest_progress(&self) -> Option<ProgressRecord> {
        self.inner.progress.latest()
    }

    pub fn progress_history(&self) -> Vec<ProgressRecord> {
        self.inner.progress.history()
    }

    pub fn save_metric(&self, name: &str, value: f64, step: Step) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.metrics.save(MetricRecord::new(name, value, step))
    }

    pub fn save_metrics(&self, records: impl IntoIterator<Item = MetricRecord>) -> Result<()> {
        self.inner.ensure_active()?;
        records
            .into_iter()
            .try_for_each(|record| self.inner.metrics.save(record))
    }

    pub fn metric_series(&self, name: &str) -> Vec<MetricRecord> {
        self.inner.metrics.series(name)
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.inner.metrics.names()
    }

    /// Materialize a dataset snapshot, once per run
    pub async fn fetch_snapshot(&self, snapshot_id: &str) -> Result<DatasetSnapshot> {
        self.inner.ensure_active()?;
        let cached = self.inner.snapshot_cache.lock().get(snapshot_id).cloned();
        if let Some(snapshot) = cached {
            return Ok(snapshot);
        }

        let snapshot = self.inner.snapshots.fetch(snapshot_id).await?;
        let mut cache = self.inner.snapshot_cache.lock();
        Ok(cache
            .entry(snapshot_id.to_string())
            .or_insert(snapshot)
            .clone())
    }

    /// Fetch a snapshot (cached) and index one of its splits
    pub async fn prepare_snapshot_split(&self, snapshot_id: &str, split: Option<&str>) -> Result<SnapshotSplit> {
        let snapshot = self.fetch_snapshot(snapshot_id).await?;
        SnapshotSplit::open(&snapshot, split).await
    }

    /// Upload the checkpoint directory under `remote_prefix`
    pub async fn upload_checkpoints(&self, remote_prefix: &str) -> Result<usize> {
        self.inner.ensure_active()?;
        let transfer = self
            .inner
            .transfer
            .as_ref()
            .ok_or_else(|| Error::config("no remote transfer configured for this run"))?;
        transfer
            .upload(&self.inner.checkpoint_dir, remote_prefix)
            .await
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.inner.identity.run_id)
            .field("working_dir", &self.inner.identity.working_dir)
            .field("state", &self.state())
            .finish()
    }
}

/// Active run guard; closing it finalizes the run exactly once
pub struct RunScope {
    context: RunContext,
    finished: bool,
}

impl RunScope {
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Finalize the run with the outcome of the training code
    ///
    /// `Ok` completes the run, or interrupts it if an interruption was
    /// received. `Err(Error::Interrupted)` interrupts the run and is
    /// swallowed, yielding `Ok(None)`. Any other error fails the run and is
    /// returned after the finalize pass.
    pub fn finish<T>(mut self, outcome: Result<T>) -> Result<Option<T>> {
        self.finished = true;
        let inner = &self.context.inner;

        match outcome {
            Ok(value) => {
                let terminal = if inner.signals.is_interrupted() {
                    RunState::Interrupted
                } else {
                    RunState::Completed
                };
                inner.finalize(terminal, None)?;
                Ok(Some(value))
            }
            Err(e) if e.is_interruption() => {
                info!(run_id = %inner.identity.run_id, "Run stopped after interruption");
                inner.finalize(RunState::Interrupted, None)?;
                Ok(None)
            }
            Err(e) => {
                error!(run_id = %inner.identity.run_id, error = %e, "Run failed");
                if let Err(finalize_error) = inner.finalize(RunState::Failed, Some(e.to_string())) {
                    error!(error = %finalize_error, "Finalize pass failed");
                }
                Err(e)
            }
        }
    }

    /// Run `f` with a handle to the context and finish with its outcome
    pub async fn run<F, Fut, T>(self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(RunContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = f(self.context.clone()).await;
        self.finish(outcome)
    }
}

impl Deref for RunScope {
    type Target = RunContext;

    fn deref(&self) -> &RunContext {
        &self.context
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let inner = &self.context.inner;
        let (terminal, reason) = if std::thread::panicking() {
            (RunState::Failed, Some("run scope exited by panic".to_string()))
        } else if inner.signals.is_interrupted() {
            (RunState::Interrupted, None)
        } else {
            (RunState::Completed, None)
        };
        if let Err(e) = inner.finalize(terminal, reason) {
            error!(run_id = %inner.identity.run_id, error = %e, "Finalize on drop failed");
        }
    }
}
