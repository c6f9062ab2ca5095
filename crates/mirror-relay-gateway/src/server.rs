//! Axum-based relay server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{login_handler, logout_handler, require_auth};
use crate::routes::{
    app_state_handler, bridge_handler, chat_feedback_handler, command_handler, health_handler,
    snapshot_handler, ws_handler,
};
use crate::state::RelayState;

/// Build the full router. The auth gate wraps everything, including the UI.
pub fn build_router(state: Arc<RelayState>) -> Router {
    // API and socket routes are registered first so they take priority over
    // the UI catch-all.
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/app-state", get(app_state_handler))
        .route("/api/chat-feedback", get(chat_feedback_handler))
        .route("/api/command", post(command_handler))
        .route("/ws", get(ws_handler))
        .route("/bridge", get(bridge_handler))
        .with_state(state.clone());

    if state.config.ui_enabled() {
        app = app.merge(mirror_relay_web::ui_router());
    }

    app.layer(middleware::from_fn_with_state(state, require_auth))
        .layer(TraceLayer::new_for_http())
}

/// Expose Prometheus text at `/metrics`.
#[cfg(feature = "metrics")]
pub fn with_metrics(
    app: Router,
    handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Router {
    app.route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

/// Bind the configured address.
pub async fn bind(state: &RelayState) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", state.config.relay_bind(), state.config.relay_port());
    let listener = TcpListener::bind(&addr).await?;
    info!("Relay listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve `app` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    info!("Relay stopped");
    Ok(())
}
