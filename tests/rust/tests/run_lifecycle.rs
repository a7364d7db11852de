//! End-to-end run lifecycle tests
//!
//! Drives a simulated training loop through a local run context and checks
//! what a later process would find in the working directory:
//! - interruption mid-loop with cooperative shutdown
//! - failure with the original error surfaced
//! - resume from the latest checkpoint with restored progress and metrics

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use run_context::{local_run_context, LocalRunOptions, RunContext, STATUS_FILE};
use run_core::{Error, Mapping, RunSettings, RunState, RunStatus, SignalHandler};
use serde_json::json;
use tempfile::TempDir;

fn settings() -> RunSettings {
    let mut settings = RunSettings::default();
    settings.signals.install = false;
    settings.savers.flush_threshold = 4;
    settings
}

fn options(dir: &Path) -> LocalRunOptions {
    LocalRunOptions::new("e2e-run", dir).settings(settings())
}

fn read_status(dir: &Path) -> Result<RunStatus> {
    let data = std::fs::read(dir.join(STATUS_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}

fn step_metadata(step: u64) -> Mapping {
    let mut metadata = Mapping::new();
    metadata.insert("global_step".to_string(), json!(step));
    metadata
}

/// Toy training loop: one metric and progress record per step, a checkpoint
/// every `every` steps and once more on the way out
async fn train(ctx: RunContext, start: u64, steps: u64, every: u64) -> run_core::Result<u64> {
    let mut last = start;
    for step in start + 1..=steps {
        if ctx.is_interrupted() {
            break;
        }
        ctx.save_metric("loss", 1.0 / step as f64, step)?;
        ctx.save_progress(0, step, Mapping::new())?;
        if step % every == 0 {
            ctx.save_checkpoint(&format!("step-{}", step), step.to_le_bytes().to_vec(), step_metadata(step))
                .await?;
        }
        last = step;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    ctx.save_checkpoint("last", last.to_le_bytes().to_vec(), step_metadata(last))
        .await?;
    Ok(last)
}

#[tokio::test]
async fn test_interrupted_run_is_consistent_and_resumable() -> Result<()> {
    let dir = TempDir::new()?;
    let signals = SignalHandler::new();

    let scope = local_run_context(options(dir.path()).signal_handler(signals.clone())).await?;
    let hook_calls = Arc::new(Mutex::new(0));
    let calls = hook_calls.clone();
    scope.register_hook("count", move || {
        *calls.lock() += 1;
        Ok(())
    });

    // Deliver the interruption from another task while the loop runs
    let interrupter = tokio::spawn({
        let signals = signals.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tokio::task::spawn_blocking(move || signals.interrupt()).await
        }
    });

    let outcome = train(scope.context().clone(), 0, 10_000, 5).await;
    let ctx = scope.context().clone();
    let last = scope.finish(outcome)?.expect("loop returns its last step");
    assert!(interrupter.await??);

    assert!(last < 10_000);
    assert_eq!(*hook_calls.lock(), 1);
    assert_eq!(ctx.state(), RunState::Interrupted);
    assert_eq!(read_status(dir.path())?.state, RunState::Interrupted);

    // Everything saved before finish is on disk
    let resumed = local_run_context(options(dir.path())).await?;
    assert_eq!(resumed.latest_progress().map(|p| p.step), Some(last));
    assert_eq!(resumed.metric_series("loss").len() as u64, last);

    let latest = resumed.latest_checkpoint().await?;
    assert_eq!(latest.id, "last");
    assert_eq!(latest.metadata["global_step"], json!(last));

    let ids: Vec<String> = resumed
        .list_checkpoints()
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids.last().map(String::as_str), Some("last"));
    assert!(ids.iter().all(|id| id == "last" || id.starts_with("step-")));

    let next = train(resumed.context().clone(), last, last + 10, 5).await;
    let ctx = resumed.context().clone();
    assert_eq!(resumed.finish(next)?, Some(last + 10));
    assert_eq!(ctx.state(), RunState::Completed);
    assert_eq!(read_status(dir.path())?.state, RunState::Completed);
    Ok(())
}

#[tokio::test]
async fn test_failed_run_reports_original_error() -> Result<()> {
    let dir = TempDir::new()?;
    let scope = local_run_context(options(dir.path()).model_path(dir.path().join("missing.safetensors"))).await?;

    let result = scope
        .run(|ctx| async move {
            ctx.save_metric("loss", 0.9, 1)?;
            ctx.save_progress(0, 1, Mapping::new())?;
            let model = ctx.load_model()?;
            Ok(model.size_bytes)
        })
        .await;

    assert!(matches!(result, Err(Error::ModelNotFound { .. })));

    let status = read_status(dir.path())?;
    assert_eq!(status.state, RunState::Failed);
    assert!(status.error.is_some());

    // Best-effort flush still happened
    assert!(dir.path().join("progress/000000000000.json").exists());
    assert!(dir.path().join("metrics/loss/000000000000.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_cooperative_interrupt_error() -> Result<()> {
    let dir = TempDir::new()?;
    let scope = local_run_context(options(dir.path())).await?;

    let result = scope
        .run(|ctx| async move {
            ctx.save_metric("loss", 0.9, 1)?;
            Err::<(), _>(Error::Interrupted)
        })
        .await?;

    assert!(result.is_none());
    assert_eq!(read_status(dir.path())?.state, RunState::Interrupted);
    Ok(())
}
