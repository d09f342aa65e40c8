use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::{AdminInterface, CacheOutcome};

use super::error::FailureReport;

const TARGET: &str = "pagecache::http::request";

/// Tags every request on the admin listener so the page cache leaves it alone.
pub async fn mark_admin_interface(mut request: Request<Body>, next: Next) -> Response {
    request.extensions_mut().insert(AdminInterface);
    next.run(request).await
}

/// One log line per request, with what the page cache did with it.
///
/// Responses carrying a [`FailureReport`] are logged at warn (4xx) or error
/// (5xx) with the error chain; everything else at debug.
pub async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let failure = response.extensions_mut().remove::<FailureReport>();
    let server_error = response.status().is_server_error();
    let status = response.status().as_u16();
    let elapsed_ms = start.elapsed().as_millis();
    let outcome = response.extensions().get::<CacheOutcome>().copied();
    let cache = outcome.map_or("none", CacheOutcome::as_str);
    let reason = outcome.and_then(CacheOutcome::reason).map_or("", |reason| reason.as_str());

    match failure {
        Some(report) if server_error => error!(
            target: TARGET,
            status, method = %method, path, cache, reason, elapsed_ms, %request_id,
            source = report.source, detail = report.detail(), chain = ?report.chain,
            "request failed"
        ),
        Some(report) => warn!(
            target: TARGET,
            status, method = %method, path, cache, reason, elapsed_ms, %request_id,
            source = report.source, detail = report.detail(),
            "request rejected"
        ),
        None => debug!(
            target: TARGET,
            status, method = %method, path, cache, reason, elapsed_ms, %request_id,
            "request served"
        ),
    }

    response
}
