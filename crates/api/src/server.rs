//! Server lifecycle: workers up, serve HTTP, then drain in order.
//!
//! Shutdown order: stop accepting HTTP requests, stop the delivery workers
//! (each finishes its in-flight delivery), then force a final buffer flush.
//! If that flush fails the remaining rows are lost and logged with a count.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use courier_infra::delivery::{WorkerConfig, WorkerStats};

use crate::app::{build_app, services::AppServices};

/// What happened during shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers: Vec<WorkerStats>,
    pub failed_workers: usize,
    pub flushed_rows: usize,
    pub lost_rows: usize,
}

pub async fn run<F>(
    listener: TcpListener,
    services: Arc<AppServices>,
    workers: usize,
    worker_config: WorkerConfig,
    shutdown: F,
) -> anyhow::Result<ShutdownReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handles = services.spawn_workers(workers, worker_config);
    info!(workers = handles.len(), "delivery workers started");

    let app = build_app(services.clone());
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("http server stopped");

    let mut report = ShutdownReport::default();
    for handle in handles {
        let name = handle.name().to_string();
        match handle.shutdown().await {
            Ok(stats) => report.workers.push(stats),
            Err(e) => {
                warn!(worker = %name, error = %e, "worker ended with error");
                report.failed_workers += 1;
            }
        }
    }

    match services.flush_buffer().await {
        Ok(flush) => {
            info!(rows = flush.rows, "final analytics flush complete");
            report.flushed_rows = flush.rows;
        }
        Err(e) => {
            report.lost_rows = services.buffer().len();
            error!(lost_rows = report.lost_rows, error = %e, "final analytics flush failed; buffered rows lost");
        }
    }

    Ok(report)
}

/// Resolves on Ctrl-C (or SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
