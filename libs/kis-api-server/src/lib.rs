mod http;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;

use kis_core::{HealthChecker, Ingestor};

#[derive(Clone)]
pub struct AppState {
    ingestor: Arc<Ingestor>,
    health: Arc<HealthChecker>,
    /// Per-request deadline for `/konglogs`.
    timeout: Duration,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>, health: Arc<HealthChecker>, timeout: Duration) -> Self {
        Self { ingestor, health, timeout }
    }
}

/// Routes: `POST /konglogs`, `GET /health`, `GET /`.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(http::handle_root))
        .route("/health", get(http::handle_health))
        .route(
            "/konglogs",
            post(http::handle_konglogs).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .with_state(state)
}

/// Serve the ingestion API until `shutdown` fires. In-flight requests finish.
pub async fn run(
    address: &str,
    state: AppState,
    max_body_bytes: usize,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let app = router(state, max_body_bytes);

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| format!("bind {address}: {e}"))?;
    tracing::info!(%address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}
