//! Per-request logging middleware, adapted from the teacher's
//! `middleware/logging.rs::log_headers_middleware`.

use axum::{extract::Request, middleware::Next, response::Response};

pub async fn log_requests_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let has_authorization = request.headers().contains_key("authorization");

    let start = std::time::Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed();

    tracing::info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        has_authorization,
        "handled request"
    );

    response
}
