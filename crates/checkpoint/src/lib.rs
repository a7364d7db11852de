//! Checkpoint management for training runs
//!
//! Provides the checkpoint capability (`save`, `load`, `list`) and a local
//! filesystem implementation built on an atomic write protocol: a checkpoint
//! is either fully visible or not visible at all, whatever the moment the
//! process is interrupted.

pub mod manager;
pub mod writer;

pub use manager::{
    validate_checkpoint_id, CheckpointManager, CheckpointManagerHandle, LocalCheckpointManager,
    LocalCheckpointManagerConfig,
};
pub use writer::{CheckpointHeader, CheckpointWriter};
