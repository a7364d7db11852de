//! Storage - Pluggable storage backends for training runs
//!
//! Provides:
//! - Atomic local file replacement ([`atomic`])
//! - Async object storage backends: local filesystem (default feature) and
//!   Amazon S3 / S3-compatible storage (with `s3` feature)
//! - Directory upload/download over any backend ([`RemoteTransfer`])
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use storage::{BackendTransfer, LocalStorage, RemoteTransfer};
//!
//! # async fn example() -> run_core::Result<()> {
//! let remote = Arc::new(LocalStorage::new("/mnt/shared"));
//! let transfer = BackendTransfer::new(remote);
//! transfer.upload(Path::new("./runs/run-1/checkpoints"), "runs/run-1/checkpoints/").await?;
//! # Ok(())
//! # }
//! ```

pub mod atomic;
mod backend;
mod local;
pub mod retry;
mod transfer;

#[cfg(feature = "s3")]
mod s3;

pub use backend::StorageBackend;
pub use local::LocalStorage;
pub use transfer::{file_path_to_key, key_to_file_path, BackendTransfer, RemoteTransfer};

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Credentials, S3Location, S3Storage};
