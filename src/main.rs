use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aasx_store::config::{Config, GcMode};
use aasx_store::db::Database;
use aasx_store::services::BlobService;
use aasx_store::storage::{LocalStorage, StorageProvider};
use aasx_store::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aasx_store=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting aasx-store...");

    // Load configuration
    let config = Config::load()?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let storage: Arc<dyn StorageProvider> = Arc::new(LocalStorage::new(&config.storage));
    tracing::info!("Blob storage initialized ({})", storage.storage_type());

    if config.gc.mode == GcMode::Deferred {
        spawn_sweeper(
            db.clone(),
            storage.clone(),
            Duration::from_secs(config.gc.sweep_interval_secs),
        );
    }

    // Create app state
    let state = AppState {
        db,
        config: config.clone(),
        storage,
    };

    // Build router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically erase zero-reference blobs
fn spawn_sweeper(db: Database, storage: Arc<dyn StorageProvider>, every: Duration) {
    tracing::info!("Deferred GC enabled, sweeping every {:?}", every);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = BlobService::sweep(&db, storage.as_ref()).await {
                tracing::error!("GC sweep failed: {}", e);
            }
        }
    });
}
