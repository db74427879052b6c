mod admission;
mod api;
mod config;
mod error;
mod kv;
mod ledger;
mod object_store;
mod paths;
mod preview;
mod publish;

use admission::Admission;
use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use config::Config;
use kv::KvStore;
use ledger::Ledger;
use object_store::ObjectStore;
use preview::PreviewService;
use publish::PublishService;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting pagedrop service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let ledger = Arc::new(
        Ledger::new(&config.database)
            .await
            .context("Failed to initialize ledger")?,
    );

    if config.database.run_migrations {
        ledger
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = Arc::new(
        ObjectStore::new(&config.storage)
            .await
            .context("Failed to initialize object store client")?,
    );

    let kv = KvStore::new(&config.redis)
        .await
        .context("Failed to initialize KV store")?;

    let admission = Arc::new(Admission::new(kv.clone(), config.lock_ttl()));

    let preview_service = Arc::new(PreviewService::new(
        object_store.clone(),
        ledger.clone(),
        config.limits.clone(),
    ));
    let publish_service = Arc::new(PublishService::new(
        object_store.clone(),
        ledger.clone(),
        config.limits.clone(),
    ));

    let state = AppState {
        admission,
        preview_service,
        publish_service,
        ledger,
        kv,
        admission_config: config.admission.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    info!("Pagedrop service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down pagedrop service");

    api_handle.abort();

    info!("Pagedrop service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
