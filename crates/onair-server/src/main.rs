mod config;
mod routes;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use onair_session::process_unload_signal;
use onair_store::{MemoryStore, PresenceStore, SqliteStore};

use crate::config::{ServerConfig, StoreKind};
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onair=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let addr = config.addr()?;

    let store: Arc<dyn PresenceStore> = match config.store {
        StoreKind::Memory => {
            info!("Using in-memory presence store");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Sqlite => {
            info!("Using SQLite presence store at {}", config.db_path.display());
            Arc::new(SqliteStore::open(&config.db_path)?)
        }
    };

    let app = routes::router(AppState { store })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("OnAir server listening on {}", addr);

    let shutdown = process_unload_signal();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("OnAir server stopped");
    Ok(())
}
