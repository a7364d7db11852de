//! Run Context - lifecycle management for a single training run
//!
//! Supplies a run with configuration, a model artifact, dataset snapshots and
//! durable channels for checkpoints, progress and metrics. Every backend is a
//! trait object picked at construction:
//!
//! - [`ConfigLoader`]: file (JSON/YAML) or in-memory configuration
//! - [`ModelLoader`]: local model artifacts
//! - [`ProgressSaver`] / [`MetricSaver`]: in-memory or durable local savers
//! - [`SnapshotFetcher`]: local or remote dataset snapshots
//! - [`checkpoint::CheckpointManager`]: atomic local checkpoints
//!
//! # Example
//!
//! ```no_run
//! use run_context::{local_run_context, LocalRunOptions};
//! use run_core::Mapping;
//!
//! # async fn example() -> run_core::Result<()> {
//! let scope = local_run_context(
//!     LocalRunOptions::new("run-1", "./runs/run-1").config_file("config.yaml"),
//! )
//! .await?;
//!
//! let outcome = async {
//!     let config = scope.load_config()?;
//!     for step in 0..100 {
//!         if scope.is_interrupted() {
//!             break;
//!         }
//!         scope.save_metric("loss", 1.0 / (step + 1) as f64, step)?;
//!     }
//!     scope.save_checkpoint("final", Vec::<u8>::new(), Mapping::new()).await?;
//!     Ok::<_, run_core::Error>(config)
//! }
//! .await;
//! scope.finish(outcome)?;
//! # Ok(())
//! # }
//! ```

pub mod config_loader;
pub mod context;
pub mod dataset;
pub mod local;
pub mod metrics;
pub mod model_loader;
pub mod progress;
mod records;

pub use config_loader::{ConfigFormat, ConfigLoader, FileConfigLoader, MemoryConfigLoader};
pub use context::{RunContext, RunContextBuilder, RunScope, STATUS_FILE};
pub use dataset::{Datum, LocalSnapshotFetcher, RemoteSnapshotFetcher, SnapshotFetcher, SnapshotSplit};
pub use local::{local_run_context, ConfigSource, LocalRunOptions};
pub use metrics::{LocalMetricSaver, MemoryMetricSaver, MetricSaver};
pub use model_loader::{LocalModelLoader, ModelFormat, ModelHandle, ModelLoader};
pub use progress::{LocalProgressSaver, MemoryProgressSaver, ProgressSaver};
