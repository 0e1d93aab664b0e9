//! Admission trigger binary.
//!
//! Reads one queue batch event as JSON from stdin and writes the partial
//! batch response to stdout. Logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vproc_trigger::{AdmissionTrigger, BatchScheduler, SqsEvent, TriggerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .init();
    }

    let config = TriggerConfig::from_env()?;
    info!("Trigger config: {:?}", config);

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read event from stdin")?;
    let event: SqsEvent = serde_json::from_str(&input).context("Failed to parse event")?;

    let scheduler = Arc::new(BatchScheduler::from_env().await);
    let trigger = AdmissionTrigger::new(config, scheduler);

    let outcome = trigger.handle(&event).await;
    println!("{}", serde_json::to_string(&outcome.response)?);

    Ok(())
}
