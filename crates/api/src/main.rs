use std::sync::Arc;

use anyhow::Context;

use courier_api::{app::services, server};
use courier_infra::{config::Config, delivery::WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; real environment variables win either way.
    let _ = dotenvy::dotenv();
    courier_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let services = Arc::new(services::build_services(&config).await?);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    let report = server::run(
        listener,
        services,
        config.workers,
        WorkerConfig::default(),
        server::shutdown_signal(),
    )
    .await?;

    tracing::info!(
        workers = report.workers.len(),
        failed_workers = report.failed_workers,
        flushed_rows = report.flushed_rows,
        lost_rows = report.lost_rows,
        "shutdown complete"
    );
    Ok(())
}
