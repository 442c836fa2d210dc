//! vmfleet controller
//!
//! Runs the task worker and cron triggers against Postgres and the compute
//! and bot fleet APIs, and serves health and metrics over HTTP.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmfleet_controller::{
    api::{self, AppState},
    clock::SystemClock,
    config::ControllerConfig,
    cron::CronWorker,
    db::Database,
    deps::Deps,
    dispatch::{TaskWorker, WorkerConfig},
    handlers::Handlers,
    metrics::{install_prometheus, FleetMetrics},
    providers::{GceClient, SwarmingClient},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::from_env()?;

    // Prefer RUST_LOG, fall back to VMFLEET_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmfleet controller");
    info!(listen_addr = %config.listen_addr, compute = %config.compute_endpoint, "Configuration loaded");

    let prometheus = match install_prometheus() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install metrics recorder");
            None
        }
    };

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let store = Arc::new(db.entity_store());
    let queue = Arc::new(db.task_queue());
    let compute = GceClient::new(config.compute_endpoint.clone(), config.access_token.clone())?;
    let fleet = SwarmingClient::new(config.access_token.clone())?;

    let handlers = Handlers::new(Deps {
        store: store.clone(),
        dispatcher: queue.clone(),
        compute: Arc::new(compute),
        fleet: Arc::new(fleet),
        clock: Arc::new(SystemClock),
        metrics: FleetMetrics::new(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task_worker = TaskWorker::new(
        queue,
        handlers.clone(),
        WorkerConfig {
            poll_interval: config.worker_poll_interval,
            ..WorkerConfig::all_queues(config.queue_concurrency)
        },
    );
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            task_worker.run(shutdown_rx).await;
        }
    });

    let cron_worker = CronWorker::new(handlers, config.cron_intervals())
        .with_failed_task_retention(config.failed_task_retention);
    let cron_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cron_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState { store, prometheus });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Task worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, cron_handle).await {
        warn!(error = %e, "Cron worker did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
