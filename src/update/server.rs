use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::api::{self, AppState};
use super::db::{DbHandle, StatusDb};
use super::hub::StatusHub;
use super::pipeline::UpdatePipeline;
use super::ws;
use crate::config::UpliftConfig;

/// Build the full application router: control surface, history and the
/// progress WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the database, wire the pipeline and serve until Ctrl+C.
pub async fn start_server(config: UpliftConfig) -> Result<()> {
    let server = &config.server;
    if let Some(parent) = server.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = DbHandle::new(
        StatusDb::new(&server.db_path).context("Failed to initialize status database")?,
    );
    let hub = StatusHub::new(Arc::new(db.clone()));
    let pipeline = UpdatePipeline::from_config(&config, hub.clone(), db.clone())?;

    let state = Arc::new(AppState {
        hub,
        db,
        pipeline: Arc::new(pipeline),
    });

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("uplift listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
