//! Run Core - Foundation for the training run context
//!
//! Provides core types, error handling, runtime settings and the
//! interruption-aware signal handler shared by every backend crate.

pub mod config;
pub mod error;
pub mod signal;
pub mod types;

pub use config::{CheckpointSettings, RetryConfig, RunSettings, SaverConfig, SignalConfig};
pub use error::{Error, Result};
pub use signal::{FinalizeHook, SignalHandler, SignalListener};
pub use types::*;
