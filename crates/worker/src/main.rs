use std::sync::Arc;

use anyhow::{Context, Result};
use bulwark_core::telemetry::{init_telemetry, TelemetryConfig};
use bulwark_core::{CancelContext, CoreConfig, TaskCore};
use bulwark_worker::{run_demo, spawn_stats_reporter, DemoConfig, FlakyDownstream, ReportIngest};

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    // Configure via environment variables:
    // - BULWARK_SERVICE_NAME: Service name (default: "bulwark-worker")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "bulwark_worker=info,bulwark_core=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "bulwark" {
        telemetry_config.service_name = "bulwark-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("bulwark_worker=info,bulwark_core=info".to_string());
    }
    init_telemetry(&telemetry_config).context("Failed to initialize telemetry")?;

    tracing::info!("bulwark-worker starting...");

    let config = CoreConfig::from_env();
    let demo = DemoConfig::from_env();

    tracing::info!(
        worker_count = config.worker_count,
        queue_capacity = config.queue_capacity,
        refill_rate = config.token_refill_rate,
        shard_count = config.shard_count,
        jobs = demo.jobs,
        failure_rate = demo.failure_rate,
        "Starting task core"
    );

    let core = Arc::new(TaskCore::new(config).context("Invalid core configuration")?);

    let downstream = Arc::new(FlakyDownstream::new(
        demo.failure_rate,
        demo.downstream_latency,
    ));
    let ingest = ReportIngest::new(&core, downstream.clone());
    let buffers = ingest.buffers().clone();
    core.register_handler(move |job, ctx| {
        let ingest = ingest.clone();
        async move { ingest.handle(job, ctx).await }
    });
    core.start().context("Failed to start worker pool")?;

    let root = CancelContext::new();
    let reporter = spawn_stats_reporter(core.clone(), demo.stats_interval, root.child());

    // Run the demo (until done or interrupted)
    tokio::select! {
        summary = run_demo(&core, &demo, &root) => {
            tracing::info!(
                summary = %serde_json::to_string(&summary)?,
                "Demo run finished"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            root.cancel();
        }
    }

    if let Err(e) = core.shutdown(&CancelContext::new()).await {
        tracing::warn!(error = %e, "Graceful shutdown incomplete");
    }
    root.cancel();
    reporter.await.context("Stats reporter failed")?;

    tracing::info!(
        stats = %serde_json::to_string(&core.stats())?,
        buffers = %serde_json::to_string(&buffers.stats())?,
        downstream_calls = downstream.calls(),
        "Worker shutdown complete"
    );
    Ok(())
}
