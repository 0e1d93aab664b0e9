use std::path::Path;

use uuid::Uuid;
use vproc_queue::SqsQueue;
use vproc_worker::{AnalyzerConfig, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );
    ensure_writable(&config.work_dir).await?;
    ensure_writable(&config.results_dir).await?;
    ensure_analysis_command()?;
    ensure_env_present(&["SQS_QUEUE_URL"])?;
    ensure_queue_reachable().await?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_writable<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;

    let probe = path.join(format!(".selfcheck-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("{} is not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_analysis_command() -> anyhow::Result<()> {
    let config = AnalyzerConfig::from_env();
    match config.command.first() {
        Some(program) => {
            println!("worker-selfcheck: analysis command {}", program);
            Ok(())
        }
        None => Err(anyhow::anyhow!("ANALYSIS_COMMAND is empty")),
    }
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        let present = std::env::var(var).is_ok()
            || (*var == "SQS_QUEUE_URL" && std::env::var("AWS_SQS_QUEUE_URL").is_ok());
        if !present {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}

async fn ensure_queue_reachable() -> anyhow::Result<()> {
    let queue = SqsQueue::from_env().await?;
    let attributes = queue
        .queue_attributes()
        .await
        .map_err(|e| anyhow::anyhow!("queue {} not reachable: {}", queue.queue_url(), e))?;

    println!(
        "worker-selfcheck: queue reachable, ~{} messages visible",
        attributes
            .get("ApproximateNumberOfMessages")
            .map(String::as_str)
            .unwrap_or("?")
    );
    Ok(())
}
