//! HTTP front end: device check-ins plus the JSON admin API

pub mod admin;
pub mod checkin;
pub mod conn;

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use axum::Router;
use espota_core::{AssignmentStore, AuditSink, CheckinHandler, ContentResolver, HeaderNames};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub handler: CheckinHandler,
    pub store: Arc<dyn AssignmentStore>,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        audit: Arc<dyn AuditSink>,
        names: HeaderNames,
    ) -> Self {
        let handler = CheckinHandler::new(ContentResolver::new(store.clone()), names);
        Self {
            handler,
            store,
            audit,
        }
    }
}

/// Routes behind the check-in path: the admin API under `/admin` when enabled
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    let mut app = Router::new();
    if config.admin_enabled {
        app = app.nest("/admin", admin::routes());
    }
    app.with_state(state)
}

/// Serve on `listen` until Ctrl-C
pub async fn serve(state: AppState, config: &ServerConfig, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Listening on {}", listener.local_addr()?);

    let app = router(state.clone(), config);
    conn::run(listener, app, state, &config.checkin_path, shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received"),
        Err(e) => {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
