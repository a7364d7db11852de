//! Local run binary entry point
//!
//! Drives a toy training loop through a local run context. Ctrl-C stops the
//! loop cooperatively; the run is then finalized as interrupted and can be
//! resumed from its last checkpoint.
//!
//! Usage: `local-run <run_id> [working_dir] [steps] [config_path]`
//!
//! Built with the `s3` feature, `LOCAL_RUN_REMOTE=s3://bucket/root` fetches
//! dataset snapshots from `<root>/datasets/` and uploads the checkpoints to
//! `<root>/runs/<run_id>/checkpoints/` once training ends.
//! `LOCAL_RUN_S3_ENDPOINT` points it at an S3-compatible server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use run_context::{local_run_context, LocalRunOptions, RemoteSnapshotFetcher, RunContext};
use run_core::Mapping;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CHECKPOINT_EVERY: u64 = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "local_run=info,run_context=info,checkpoint=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let run_id = args.next().unwrap_or_else(|| "local-run".to_string());
    let working_dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./runs").join(&run_id));
    let steps: u64 = match args.next() {
        Some(raw) => raw.parse().context("steps must be a positive integer")?,
        None => 200,
    };

    let mut options = LocalRunOptions::new(run_id.clone(), working_dir.clone());
    if let Some(config_path) = args.next() {
        options = options.config_file(config_path);
    }

    let remote = remote::connect(&options.settings).await?;
    if let Some(transfer) = &remote {
        let fetcher = RemoteSnapshotFetcher::new(transfer.clone(), "datasets/", working_dir.join("datasets"));
        options = options.snapshot_fetcher(Arc::new(fetcher)).transfer(transfer.clone());
    }

    let scope = local_run_context(options)
        .await
        .context("failed to start the run")?;
    let mut outcome = train(scope.context().clone(), steps).await;
    if outcome.is_ok() && remote.is_some() {
        outcome = scope
            .upload_checkpoints(&format!("runs/{}/checkpoints/", run_id))
            .await
            .map(|count| tracing::info!(count, "Uploaded checkpoints"));
    }
    let context = scope.context().clone();
    scope.finish(outcome)?;

    tracing::info!(state = %context.state(), "Run finished");
    Ok(())
}

async fn train(ctx: RunContext, steps: u64) -> run_core::Result<()> {
    let config = ctx.load_config()?;
    let lr = config.get("lr").and_then(|v| v.as_f64()).unwrap_or(0.1);

    let start = match ctx.latest_checkpoint().await {
        Ok(checkpoint) => {
            let step = checkpoint
                .metadata
                .get("global_step")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            tracing::info!(checkpoint_id = %checkpoint.id, step, "Resuming from checkpoint");
            step
        }
        Err(run_core::Error::CheckpointNotFound { .. }) => 0,
        Err(e) => return Err(e),
    };

    let mut loss = 1.0;
    for step in start + 1..=steps {
        if ctx.is_interrupted() {
            tracing::warn!(step, "Interruption received, stopping training loop");
            break;
        }

        loss *= 1.0 - lr * 0.05;
        ctx.save_metric("train/loss", loss, step)?;

        let mut extra = Mapping::new();
        extra.insert("operation".to_string(), json!("training"));
        extra.insert("final_value".to_string(), json!(steps));
        ctx.save_progress(0, step, extra)?;

        if step % CHECKPOINT_EVERY == 0 || step == steps {
            let mut metadata = Mapping::new();
            metadata.insert("global_step".to_string(), json!(step));
            metadata.insert("loss".to_string(), json!(loss));
            ctx.save_checkpoint(&format!("step-{}", step), step.to_le_bytes().to_vec(), metadata)
                .await?;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Ok(())
}

#[cfg(feature = "s3")]
mod remote {
    use std::sync::Arc;

    use anyhow::Context;
    use run_core::RunSettings;
    use storage::{RemoteTransfer, S3Config, S3Location, S3Storage};

    pub async fn connect(settings: &RunSettings) -> anyhow::Result<Option<Arc<dyn RemoteTransfer>>> {
        let Ok(uri) = std::env::var("LOCAL_RUN_REMOTE") else {
            return Ok(None);
        };
        let location = S3Location::parse(&uri).context("LOCAL_RUN_REMOTE")?;
        let config = match std::env::var("LOCAL_RUN_S3_ENDPOINT") {
            Ok(endpoint) => S3Config::compatible(location, endpoint),
            Err(_) => S3Config::new(location),
        };

        let storage = S3Storage::connect(config).await;
        tracing::info!(location = %storage.location(), "Using S3 remote");
        Ok(Some(Arc::new(storage.into_transfer(settings.transfer.clone()))))
    }
}

#[cfg(not(feature = "s3"))]
mod remote {
    use std::sync::Arc;

    use run_core::RunSettings;
    use storage::RemoteTransfer;

    pub async fn connect(_settings: &RunSettings) -> anyhow::Result<Option<Arc<dyn RemoteTransfer>>> {
        if std::env::var_os("LOCAL_RUN_REMOTE").is_some() {
            tracing::warn!("LOCAL_RUN_REMOTE is set but this binary was built without the s3 feature");
        }
        Ok(None)
    }
}
