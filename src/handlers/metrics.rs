//! Prometheus metrics endpoint
//!
//! Exposes metrics in Prometheus text format for scraping.

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::handlers::AppState;

/// Metrics handler for Prometheus scraping
///
/// Checks the configured credentials, refreshes migration gauges and
/// returns the registry (or the merged worker shards) in text format.
///
/// # Response
///
/// - `200 OK` with metrics in Prometheus text format
/// - `400 Bad Request` for a missing or malformed `Authorization` header
/// - `401 Unauthorized` for wrong credentials
/// - `500 Internal Server Error` if metrics collection fails
///
/// # Example
///
/// ```bash
/// curl -H 'Authorization: Bearer s3cret' http://localhost:8001/metrics
/// # HELP http_requests_total_by_method Count of requests by method.
/// # TYPE http_requests_total_by_method counter
/// http_requests_total_by_method{method="GET"} 42
/// ```
pub async fn handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = state.auth().check(&headers) {
        tracing::debug!(rejection = ?rejection, "Metrics request refused");
        return rejection.into_response();
    }

    // Migration sources and shard files do blocking I/O
    let rendered = tokio::task::spawn_blocking(move || {
        state.export_migrations();
        state.render()
    })
    .await;

    match rendered {
        Ok(Ok(output)) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            output,
        )
            .into_response(),
        Ok(Err(e)) => {
            tracing::error!(
                error = %e,
                "Failed to gather metrics for Prometheus scraping"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to gather metrics: {}", e),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Metrics rendering task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to gather metrics".to_string(),
            )
                .into_response()
        }
    }
}
