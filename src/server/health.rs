//! Liveness endpoint.

use axum::http::StatusCode;

/// Returns 200 with `Hello World!` while the server is accepting connections.
pub async fn hello_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "Hello World!")
}
