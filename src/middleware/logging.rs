//! Request Logging
//! Mission: One structured line per request, latency included

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

pub async fn request_logging(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    if status.is_server_error() {
        warn!(%method, path, status = status.as_u16(),
              elapsed_ms = format!("{:.1}", elapsed_ms), "request failed");
    } else {
        info!(%method, path, status = status.as_u16(),
              elapsed_ms = format!("{:.1}", elapsed_ms), "request");
    }
    response
}
