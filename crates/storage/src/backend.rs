//! Storage backend trait definition
//!
//! Object-store style interface used for remote run artifacts. Keys are
//! relative, `/`-separated paths; each call succeeds or fails wholesale.

use async_trait::async_trait;
use bytes::Bytes;
use run_core::Result;

/// Async trait for storage backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the object stored under `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Store `data` under `path`, replacing any previous object
    ///
    /// A reader never observes a partially written object. Returns the
    /// number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the object at `path`
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if an object exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all object keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}
