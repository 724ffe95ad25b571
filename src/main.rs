//! Segment Sync Server - revisioned caption document service
//!
//! Serves documents from a sled database over JSON with optimistic
//! concurrency: every write names the revision it was based on and is
//! rejected with 409 when that revision is stale.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::info;

use segment_sync::server::{router, AppState};
use segment_sync::storage::{DocumentStore, StorageConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segment_sync=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/segments.sled".to_string());
    let mut storage_config = StorageConfig::new(&storage_path);
    if let Some(keep) = std::env::var("REVISION_HISTORY").ok().and_then(|v| v.parse().ok()) {
        storage_config = storage_config.with_revision_history(keep);
    }
    let flush_interval = Duration::from_millis(storage_config.flush_interval_ms.max(100));

    info!("Initializing storage at: {}", storage_path);
    let store = DocumentStore::open(storage_config).context("Failed to open storage")?;
    info!("Storage initialized successfully");

    let state = Arc::new(AppState::new(store));
    let flush_task = state.clone().start_background_tasks(flush_interval);

    let app = router(state.clone());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Segment sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   Documents: http://{}/api/documents/:document_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    state.shutdown();
    let _ = flush_task.await;
    Ok(())
}
