//! statuswatch - endpoint monitoring daemon.

use statuswatch::config::ServerConfig;
use statuswatch::db::Store;
use statuswatch::scheduler::Scheduler;
use statuswatch::worker::WorkerRegistry;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("statuswatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting statuswatch...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let registry = Arc::new(WorkerRegistry::new(Some(cfg.stop_timeout)));
    let scheduler = Scheduler::new(registry, store.clone(), store)
        .with_defaults(cfg.monitor.clone())
        .with_shutdown_timeout(cfg.shutdown_timeout);

    let report = scheduler.initialize().await?;
    if report.total == 0 {
        tracing::warn!("No targets configured, waiting for shutdown");
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    let report = scheduler.shutdown().await;
    if !report.abandoned.is_empty() {
        tracing::warn!("Exiting with {} workers still stopping", report.abandoned.len());
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}
