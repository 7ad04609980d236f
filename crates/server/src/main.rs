//! replhost
//!
//! Remote workspace session gateway. Serves one WebSocket per client that
//! exposes a hydrated project tree and an interactive shell.

mod auth;
mod cache;
mod compute;
mod config;
mod error;
mod logging;
mod provision;
mod remote_sync;
mod state;
mod storage;
mod terminal;
mod websocket;
mod workspace;
mod workspace_fs;

use std::sync::Arc;

use axum::{
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{auth_middleware, CredentialValidator, JwtValidator};
use crate::compute::{ComputeLifecycle, HttpCompute, NoopCompute};
use crate::config::{Args, Config};
use crate::logging::init_logging;
use crate::provision::create_workspace_handler;
use crate::remote_sync::{create_sync_channel, RemoteSync, RemoteSyncWriter};
use crate::state::AppState;
use crate::storage::{ObjectStoreBackend, StorageClient};
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args(Args::parse())?;
    let logging = init_logging()?;

    info!(
        component = "server",
        event = "server.starting",
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        cache_root = %config.cache_root.display(),
        resolution = ?config.resolution,
        log_sink = %logging.sink,
        "Starting replhost"
    );

    let backend = ObjectStoreBackend::from_config(&config.store, config.list_page_size)?;
    let storage = StorageClient::new(Arc::new(backend));

    let (sync_tx, sync_rx) = create_sync_channel();
    let sync_writer = RemoteSyncWriter::new(sync_rx, storage.clone(), config.store_timeout);
    tokio::spawn(sync_writer.run());

    let compute: Arc<dyn ComputeLifecycle> = match &config.compute_url {
        Some(url) => Arc::new(HttpCompute::new(url.clone())?),
        None => {
            warn!(
                component = "server",
                event = "server.compute.disabled",
                "No compute URL configured, disconnects will not stop workspace compute"
            );
            Arc::new(NoopCompute)
        }
    };

    let validator: Arc<dyn CredentialValidator> = Arc::new(JwtValidator::new(&config.jwt_secret));

    let state = Arc::new(AppState::new(
        &config,
        validator.clone(),
        storage,
        RemoteSync::new(sync_tx),
        compute,
    ));

    let api = Router::new()
        .route("/api/workspaces", post(create_workspace_handler))
        .route_layer(middleware::from_fn_with_state(validator, auth_middleware));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %config.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Kill every shell, then drain pending uploads before exiting.
    let terminals = state.terminals.clone();
    tokio::task::spawn_blocking(move || terminals.clear_all()).await?;
    let report = state.remote_sync.flush().await;
    info!(
        component = "server",
        event = "server.stopped",
        uploaded = report.uploaded,
        failed = report.failed,
        "Shutdown complete"
    );

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!(
        component = "server",
        event = "server.shutdown",
        "Shutdown requested"
    );
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
