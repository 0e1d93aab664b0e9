//! Long-running video analysis worker binary.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use vproc_queue::SqsQueue;
use vproc_storage::S3Store;
use vproc_worker::{
    init_tracing, metrics, status_reporter_from_env, CommandAnalyzer, ErrorTracker,
    LocalResultStore, VideoPipeline, WorkerConfig, WorkerLoop,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing();
    metrics::init_metrics_from_env();

    info!("Starting vproc-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;

    let queue = Arc::new(SqsQueue::from_env().await.context("creating queue client")?);
    let store = Arc::new(S3Store::from_env().await);
    let analyzer = Arc::new(CommandAnalyzer::from_env().context("configuring analyzer")?);
    let status = status_reporter_from_env().context("configuring status reporter")?;
    let results = Arc::new(LocalResultStore::new(config.results_dir.clone()));

    let pipeline = Arc::new(VideoPipeline::new(
        &config,
        store,
        analyzer,
        results,
        status,
        Arc::new(ErrorTracker::new()),
    ));
    let worker = WorkerLoop::new(config, queue, pipeline);

    tokio::spawn(wait_for_signal(worker.shutdown_sender()));

    let report = worker.run().await;
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        operator_attention = report.operator_attention,
        "Worker shutdown complete"
    );
    Ok(())
}

/// Flip the shutdown flag on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    info!("Received shutdown signal, finishing in-flight message");
    shutdown.send_replace(true);
}
