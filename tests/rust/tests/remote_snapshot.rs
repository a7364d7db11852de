//! Dataset snapshots and checkpoint upload through a remote store
//!
//! The "remote" is a `LocalStorage` rooted in a temp directory, optionally
//! wrapped in a backend that fails its first few calls.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use run_context::{RemoteSnapshotFetcher, RunContext};
use run_core::{Error, Mapping, RetryConfig, RunSettings};
use serde_json::json;
use storage::{BackendTransfer, LocalStorage, RemoteTransfer, StorageBackend};
use tempfile::TempDir;

/// Fails the first `failures` reads and lists with a transient error
struct FlakyBackend {
    inner: LocalStorage,
    failures: AtomicU32,
}

impl FlakyBackend {
    fn new(inner: LocalStorage, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    fn trip(&self) -> run_core::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::storage("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn read(&self, path: &str) -> run_core::Result<Bytes> {
        self.trip()?;
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> run_core::Result<u64> {
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> run_core::Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> run_core::Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> run_core::Result<Vec<String>> {
        self.trip()?;
        self.inner.list(prefix).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

fn settings() -> RunSettings {
    let mut settings = RunSettings::default();
    settings.signals.install = false;
    settings
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

async fn publish_snapshot(remote: &TempDir, snapshot_id: &str) -> Result<()> {
    let source = TempDir::new()?;
    std::fs::create_dir_all(source.path().join("train"))?;
    std::fs::write(source.path().join("train/0.bin"), b"datum-0")?;
    std::fs::write(
        source.path().join("manifest.json"),
        serde_json::to_vec(&json!({ "num_datums": 1, "task_type": "classification" }))?,
    )?;

    let transfer = BackendTransfer::new(Arc::new(LocalStorage::new(remote.path())));
    transfer
        .upload(source.path(), &format!("datasets/{}/", snapshot_id))
        .await?;
    Ok(())
}

async fn context_with_fetcher(
    work: &TempDir,
    backend: Arc<dyn StorageBackend>,
    retry: RetryConfig,
) -> Result<RunContext> {
    let transfer: Arc<dyn RemoteTransfer> = Arc::new(BackendTransfer::with_retry(backend, retry));
    let fetcher = RemoteSnapshotFetcher::new(transfer.clone(), "datasets/", work.path().join("datasets"));
    Ok(RunContext::builder("remote-run", work.path())
        .settings(settings())
        .snapshot_fetcher(Arc::new(fetcher))
        .transfer(transfer)
        .build()
        .await?)
}

#[tokio::test]
async fn test_snapshot_materialized_and_cached() -> Result<()> {
    let remote = TempDir::new()?;
    let work = TempDir::new()?;
    publish_snapshot(&remote, "mnist-v1").await?;

    let ctx = context_with_fetcher(
        &work,
        Arc::new(LocalStorage::new(remote.path())),
        RetryConfig::no_retry(),
    )
    .await?;
    let scope = ctx.enter().await?;

    let snapshot = scope.fetch_snapshot("mnist-v1").await?;
    assert_eq!(snapshot.local_path, work.path().join("datasets/mnist-v1"));
    assert_eq!(snapshot.manifest["task_type"], json!("classification"));
    assert_eq!(
        std::fs::read(snapshot.local_path.join("train/0.bin"))?,
        b"datum-0"
    );

    // Cached for the run even if the remote copy disappears
    std::fs::remove_dir_all(remote.path().join("datasets"))?;
    assert_eq!(scope.fetch_snapshot("mnist-v1").await?, snapshot);

    scope.finish(Ok(()))?;
    Ok(())
}

#[tokio::test]
async fn test_single_attempt_failure_is_snapshot_error() -> Result<()> {
    let remote = TempDir::new()?;
    let work = TempDir::new()?;
    publish_snapshot(&remote, "mnist-v1").await?;

    let backend = Arc::new(FlakyBackend::new(LocalStorage::new(remote.path()), 1));
    let ctx = context_with_fetcher(&work, backend, RetryConfig::no_retry()).await?;
    let scope = ctx.enter().await?;

    let result = scope.fetch_snapshot("mnist-v1").await;
    assert!(matches!(result, Err(Error::SnapshotFetch { .. })));
    assert!(!work.path().join("datasets/mnist-v1").exists());

    // Nothing cached on failure; the next attempt goes through
    let snapshot = scope.fetch_snapshot("mnist-v1").await?;
    assert!(snapshot.local_path.exists());
    scope.finish(Ok(()))?;
    Ok(())
}

#[tokio::test]
async fn test_retries_absorb_transient_failures() -> Result<()> {
    let remote = TempDir::new()?;
    let work = TempDir::new()?;
    publish_snapshot(&remote, "cifar-v2").await?;

    let backend = Arc::new(FlakyBackend::new(LocalStorage::new(remote.path()), 2));
    let ctx = context_with_fetcher(&work, backend, fast_retry(3)).await?;
    let scope = ctx.enter().await?;

    let snapshot = scope.fetch_snapshot("cifar-v2").await?;
    assert_eq!(snapshot.manifest["num_datums"], json!(1));
    scope.finish(Ok(()))?;
    Ok(())
}

#[tokio::test]
async fn test_upload_checkpoints_then_download() -> Result<()> {
    let remote = TempDir::new()?;
    let work = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(remote.path()));

    let ctx = context_with_fetcher(&work, storage.clone(), RetryConfig::no_retry()).await?;
    let scope = ctx.enter().await?;
    let mut metadata = Mapping::new();
    metadata.insert("global_step".to_string(), json!(100));
    scope.save_checkpoint("step-100", b"weights".to_vec(), metadata).await?;
    scope.save_checkpoint("epoch-1/best", b"best".to_vec(), Mapping::new()).await?;

    assert_eq!(scope.upload_checkpoints("runs/remote-run/checkpoints/").await?, 2);
    assert!(matches!(
        scope.upload_checkpoints("no-trailing-slash").await,
        Err(Error::InvalidRemotePrefix { .. })
    ));
    scope.finish(Ok(()))?;

    let mut keys = storage.list("runs/remote-run/").await?;
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "runs/remote-run/checkpoints/epoch-1/best".to_string(),
            "runs/remote-run/checkpoints/step-100".to_string(),
        ]
    );

    // A fresh machine restores the checkpoints and reads them back
    let restored = TempDir::new()?;
    let transfer = BackendTransfer::new(storage);
    transfer
        .download("runs/remote-run/checkpoints/", &restored.path().join("checkpoints"))
        .await?;
    let ctx = RunContext::builder("remote-run", restored.path())
        .settings(settings())
        .build()
        .await?;
    let record = ctx.load_checkpoint("step-100").await?;
    assert_eq!(record.payload, Bytes::from_static(b"weights"));
    assert_eq!(record.metadata["global_step"], json!(100));
    Ok(())
}
