//! Single-shot analysis job.
//!
//! Processes one video and exits: 0 when processed or when there was
//! nothing to do, 1 on failure.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use vproc_queue::{SqsQueue, WorkQueue};
use vproc_storage::S3Store;
use vproc_worker::{
    init_tracing, status_reporter_from_env, CommandAnalyzer, ErrorTracker, JobRunner, JobSource,
    LocalResultStore, VideoPipeline, WorkerConfig,
};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("Job setup failed: {:#}", e);
            eprintln!("vproc-job: setup failed: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env();
    let source = JobSource::from_env().context("reading job assignment")?;
    info!(direct = matches!(source, JobSource::Direct(_)), "Starting vproc-job");

    let queue: Option<Arc<dyn WorkQueue>> = match &source {
        JobSource::Direct(_) => None,
        JobSource::Poll => Some(Arc::new(
            SqsQueue::from_env().await.context("creating queue client")?,
        )),
    };

    let pipeline = Arc::new(VideoPipeline::new(
        &config,
        Arc::new(S3Store::from_env().await),
        Arc::new(CommandAnalyzer::from_env().context("configuring analyzer")?),
        Arc::new(LocalResultStore::new(config.results_dir.clone())),
        status_reporter_from_env().context("configuring status reporter")?,
        Arc::new(ErrorTracker::new()),
    ));

    let outcome = JobRunner::new(config, pipeline, queue).run(source).await;
    Ok(outcome.exit_code())
}
