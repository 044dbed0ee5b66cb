use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};

/// Log every failed response with its method, path and latency.
///
/// Cancellations (409) are expected under normal operation and stay at debug.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    if status.is_server_error() {
        error!(
            target: "precache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            "request failed",
        );
    } else if status == StatusCode::CONFLICT {
        debug!(
            target: "precache::http::response",
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            "request cancelled",
        );
    } else if status.is_client_error() {
        warn!(
            target: "precache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            "client request error",
        );
    }

    response
}
