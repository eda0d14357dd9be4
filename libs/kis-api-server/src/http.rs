use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use tokio_util::sync::CancellationToken;

use kis_core::IngestError;

use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  GET /
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_root() -> &'static str {
    "Kong Ingestion Server"
}

// ═══════════════════════════════════════════════════════════════
//  GET /health
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check(false).await;
    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, report.to_string())
}

// ═══════════════════════════════════════════════════════════════
//  POST /konglogs
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_konglogs(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !is_json(&headers) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }

    let cancel = CancellationToken::new();
    let ingest = state.ingestor.ingest(&body, &cancel);
    tokio::pin!(ingest);

    let result = tokio::select! {
        result = &mut ingest => Ok(result),
        _ = tokio::time::sleep(state.timeout) => {
            // Let the in-flight database load observe the cancellation.
            cancel.cancel();
            Err(ingest.await)
        }
    };

    match result {
        Ok(Ok(_)) => StatusCode::OK.into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, bytes = body.len(), "ingestion failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error processing logs.").into_response()
        }
        Err(late) => {
            match late {
                Err(IngestError::Cancelled) => {}
                Ok(n) => tracing::warn!(entries = n, "request timed out after the append"),
                Err(e) => tracing::error!(error = %e, "ingestion failed after timeout"),
            }
            tracing::warn!(timeout_ms = state.timeout.as_millis() as u64, "request timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "server timeout").into_response()
        }
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}
