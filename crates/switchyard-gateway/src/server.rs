//! Axum-based HTTP server.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::routes;
use crate::state::GatewayState;

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/v1/turns", post(routes::stream_turn))
        .route("/v1/turns:collect", post(routes::collect_turn))
        .route("/v1/turns/{id}/abort", post(routes::abort_turn))
        .route("/v1/budget", get(routes::budget));

    #[cfg(feature = "metrics")]
    let app = app
        .route("/metrics", get(routes::metrics))
        .route_layer(axum::middleware::from_fn(crate::metrics::track_requests));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Start the gateway HTTP server and serve until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(%e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
