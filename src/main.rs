use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use codedrop::app_state::AppState;
use codedrop::config::{AppConfig, ConfigError};
use codedrop::database::{initialize_database, DatabaseError};
use codedrop::expiry::ExpiryScheduler;
use codedrop::logging::init_logging;
use codedrop::server::router::build_router;
use codedrop::store::{ContentStore, StoreError};

#[derive(Debug, Error)]
enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database initialization error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Store initialization error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Logging error: {0}")]
    Logging(String),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging first
    init_logging().map_err(|e| AppError::Logging(e.to_string()))?;
    info!("Starting codedrop");

    // Load configuration
    let config = AppConfig::load()?;
    info!("Configuration loaded successfully");

    // Metadata database: pool plus schema
    let pool = initialize_database(&config).await?;

    // Open the store over whatever survived the last run; this re-arms
    // every persisted entry's expiry before the first request arrives
    let scheduler = ExpiryScheduler::new();
    let store = Arc::new(
        ContentStore::open(pool, config.store_options(), scheduler.clone()).await?,
    );

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(store.clone(), shutdown.clone()));

    // Create app state and router
    let state = AppState::new(store, config.clone());
    let app = build_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.bind_addr.parse()?, config.server.port);
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // stop the expiry loop and let it drain its pending timers
    shutdown.cancel();
    if let Err(err) = scheduler_task.await {
        error!(%err, "expiry scheduler task failed");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
        // without a signal stream the server can only stop via an external kill
        shutdown.cancelled().await;
        return;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
