use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod api;
mod backup;
mod storage;
mod utils;
mod web;

use crate::backup::BackupManager;
use crate::storage::ProfileStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = utils::config::load_config()?;
    utils::logging::init_tracing(config.json_logs());

    info!("Starting backup-profiles v{}", env!("CARGO_PKG_VERSION"));

    match backup::runner::probe_tool(&config.rsync_binary).await {
        Ok(version) => info!("Using {} {}", config.rsync_binary, version),
        Err(e) => warn!("{}; profiles will fail until it is installed", e),
    }

    let store = ProfileStore::open(&config.settings_path).with_context(|| {
        format!("failed to open settings {}", config.settings_path.display())
    })?;
    info!("Profiles stored in {}", store.path().display());

    let addr = config.bind_addr();
    let backup_manager = BackupManager::new(config, store);

    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(backup_manager.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(backup_manager))
        .await?;

    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal(manager: BackupManager) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
    manager.stop();
}
