//! Capture Relay
//!
//! Pushes capture commands to a user's connected client over an
//! authenticated WebSocket.

mod api;
mod auth;
mod config;
mod dispatch;
mod inbound;
mod keepalive;
mod logging;
mod registry;
mod skill;
mod state;
mod verifier;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{dispatch_handler, health_handler};
use crate::auth::dispatch_token_middleware;
use crate::config::Config;
use crate::state::AppState;
use crate::websocket::ws_handler;

/// The dispatch API is only mounted when a service token is configured.
pub(crate) fn build_router(state: Arc<AppState>, dispatch_token: Option<String>) -> Router {
    let mut app = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler));

    if let Some(token) = dispatch_token {
        let api = Router::new()
            .route("/api/users/{identity}/commands", post(dispatch_handler))
            .route_layer(from_fn_with_state(token, dispatch_token_middleware));
        app = app.merge(api);
    }

    app.layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let logging = logging::init_logging()?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        bind = %config.bind,
        keepalive_secs = config.keepalive_secs,
        dispatch_api = config.dispatch_token.is_some(),
        "Starting capture relay"
    );

    let state = Arc::new(AppState::from_config(&config)?);
    let app = build_router(state, config.dispatch_token.clone());

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
            });

            info!(
                component = "server",
                event = "server.listening",
                addr = %config.bind,
                tls = true,
                "Listening"
            );
            axum_server::bind_rustls(config.bind, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(config.bind).await?;
            info!(
                component = "server",
                event = "server.listening",
                addr = %listener.local_addr()?,
                tls = false,
                "Listening"
            );
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    info!(component = "server", event = "server.stopped", "Server stopped");
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
}
