use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use persistence::{ExportRepository, ExportStore, MemoryExportStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use export_service_api::app::{internal_router, metrics_router, public_router, AppState};
use export_service_api::config::{BusBackend, Config, StorageBackendKind, StoreBackend};
use export_service_api::jobs::{ExpireExportsJob, JobScheduler};
use export_service_api::middleware;
use export_service_api::services::{
    KafkaMessageBus, LifecycleController, MemoryMessageBus, MemoryObjectStore, MessageBus,
    ObjectStore, Publisher, S3ObjectStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;

    middleware::logging::init_logging(&config.logging)
        .context("failed to initialize logging")?;
    middleware::init_metrics().context("failed to install metrics recorder")?;

    info!("Starting export service v{}", env!("CARGO_PKG_VERSION"));

    let store = build_store(&config).await?;
    let objects = build_object_store(&config).await;
    let bus = build_message_bus(&config)?;

    let (publisher, worker) = Publisher::new(bus, &config.kafka);
    let publisher_task = worker.spawn();

    let controller = LifecycleController::new(
        store.clone(),
        objects,
        publisher,
        config.exports.default_expiry_days,
    );

    let mut scheduler = JobScheduler::new();
    scheduler.register(ExpireExportsJob::new(
        controller.clone(),
        config.exports.expiry_sweep_minutes,
    ));
    scheduler.start();

    let config = Arc::new(config);
    let state = AppState {
        store,
        controller: controller.clone(),
        config: config.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let servers = [
        ("public", config.public_addr()?, public_router(state.clone())),
        ("internal", config.private_addr()?, internal_router(state)),
        ("metrics", config.metrics_addr()?, metrics_router()),
    ];

    let mut handles = Vec::with_capacity(servers.len());
    for (name, addr, router) in servers {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {} listener on {}", name, addr))?;
        info!(server = name, %addr, "Listening");
        handles.push(tokio::spawn(serve(name, listener, router, shutdown_rx.clone())));
    }

    shutdown_signal().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    for handle in handles {
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Server exited with error"),
            Ok(Err(e)) => warn!(error = %e, "Server task panicked"),
            Err(_) => warn!("Server did not stop within {:?}", grace),
        }
    }

    scheduler.shutdown(grace).await;
    controller.shutdown(grace).await;
    publisher_task
        .shutdown(config.kafka.flush_timeout() + grace)
        .await;

    info!("Export service stopped");
    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn ExportStore>> {
    match config.database.backend {
        StoreBackend::Postgres => {
            let pool = persistence::db::create_pool(&config.database.pool_config())
                .await
                .context("failed to connect to database")?;

            info!("Running database migrations...");
            persistence::db::run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            info!("Migrations completed");

            let expiry = chrono::Duration::days(config.exports.default_expiry_days);
            let store: Arc<dyn ExportStore> =
                Arc::new(ExportRepository::new(pool).with_default_expiry(expiry));
            Ok(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory request store; state is lost on restart");
            let store: Arc<dyn ExportStore> = Arc::new(MemoryExportStore::new());
            Ok(store)
        }
    }
}

async fn build_object_store(config: &Config) -> Arc<dyn ObjectStore> {
    let objects: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackendKind::S3 => Arc::new(S3ObjectStore::new(&config.storage).await),
        StorageBackendKind::Memory => {
            warn!("Using in-memory object store");
            Arc::new(MemoryObjectStore::new())
        }
    };
    objects
}

fn build_message_bus(config: &Config) -> Result<Arc<dyn MessageBus>> {
    match config.kafka.backend {
        BusBackend::Kafka => {
            let bus: Arc<dyn MessageBus> = Arc::new(
                KafkaMessageBus::new(&config.kafka).context("failed to create Kafka producer")?,
            );
            Ok(bus)
        }
        BusBackend::Memory => {
            warn!("Using in-memory message bus; nothing reaches upstream applications");
            let bus: Arc<dyn MessageBus> = Arc::new(MemoryMessageBus::new());
            Ok(bus)
        }
    }
}

async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!(server = name, "Stopping listener");
        })
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
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
