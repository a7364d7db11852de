//! Directory transfer between the local filesystem and a storage backend
//!
//! Replicates a local directory tree under a key prefix and back. The run
//! context only relies on each call succeeding or failing as a whole.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use run_core::{Error, Result, RetryConfig};
use tokio::fs;
use tracing::{debug, info, instrument};

use crate::retry::{exhausted, with_retry};
use crate::StorageBackend;

/// Remote storage collaborator: directory upload and download
#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    /// Upload every file under `local_dir` to `remote_prefix`
    ///
    /// Returns the number of files uploaded.
    async fn upload(&self, local_dir: &Path, remote_prefix: &str) -> Result<usize>;

    /// Download every object under `remote_prefix` into `local_dir`
    ///
    /// Returns the number of files downloaded.
    async fn download(&self, remote_prefix: &str, local_dir: &Path) -> Result<usize>;
}

/// [`RemoteTransfer`] over any [`StorageBackend`]
pub struct BackendTransfer {
    backend: Arc<dyn StorageBackend>,
    retry: RetryConfig,
}

impl BackendTransfer {
    /// Transfer with a single attempt per object
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_retry(backend, RetryConfig::no_retry())
    }

    /// Transfer retrying transient failures per `retry`
    pub fn with_retry(backend: Arc<dyn StorageBackend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }
}

#[async_trait]
impl RemoteTransfer for BackendTransfer {
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    async fn upload(&self, local_dir: &Path, remote_prefix: &str) -> Result<usize> {
        check_prefix(remote_prefix)?;

        let files = walk_files(local_dir).await?;
        for file in &files {
            let key = file_path_to_key(file, local_dir, remote_prefix)?;
            let data = Bytes::from(fs::read(file).await?);
            with_retry(&self.retry, "upload", || {
                let data = data.clone();
                let key = key.clone();
                async move { self.backend.write(&key, data).await }
            })
            .await
            .map_err(|e| exhausted("upload", e))?;
            debug!(%key, "Uploaded file");
        }

        info!(count = files.len(), %remote_prefix, "Upload complete");
        Ok(files.len())
    }

    #[instrument(skip(self), fields(backend = self.backend.name()))]
    async fn download(&self, remote_prefix: &str, local_dir: &Path) -> Result<usize> {
        check_prefix(remote_prefix)?;

        let keys = with_retry(&self.retry, "list", || self.backend.list(remote_prefix))
            .await
            .map_err(|e| exhausted("list", e))?;

        for key in &keys {
            let file_path = key_to_file_path(key, local_dir, remote_prefix)?;
            let data = with_retry(&self.retry, "download", || self.backend.read(key))
                .await
                .map_err(|e| exhausted("download", e))?;

            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&file_path, &data).await?;
            debug!(%key, path = ?file_path, "Downloaded object");
        }

        info!(count = keys.len(), %remote_prefix, "Download complete");
        Ok(keys.len())
    }
}

fn check_prefix(prefix: &str) -> Result<()> {
    if prefix.ends_with('/') {
        Ok(())
    } else {
        Err(Error::InvalidRemotePrefix {
            prefix: prefix.to_string(),
        })
    }
}

/// `<local_dir>/a/b.bin` -> `<prefix>a/b.bin`
pub fn file_path_to_key(file: &Path, local_dir: &Path, prefix: &str) -> Result<String> {
    let relative = file.strip_prefix(local_dir).map_err(|_| Error::Storage {
        message: format!("{} is not under {}", file.display(), local_dir.display()),
    })?;
    let suffix = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Ok(format!("{}{}", prefix, suffix))
}

/// `<prefix>a/b.bin` -> `<local_dir>/a/b.bin`, rejecting keys that escape
pub fn key_to_file_path(key: &str, local_dir: &Path, prefix: &str) -> Result<PathBuf> {
    let stripped = key.strip_prefix(prefix).ok_or_else(|| Error::Storage {
        message: format!("Key {} is outside prefix {}", key, prefix),
    })?;

    let relative = Path::new(stripped);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if stripped.is_empty() || escapes {
        return Err(Error::Storage {
            message: format!("Refusing to materialize key {}", key),
        });
    }
    Ok(local_dir.join(relative))
}

async fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await.map_err(|e| Error::Storage {
            message: format!("Failed to read directory {}: {}", dir.display(), e),
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}
