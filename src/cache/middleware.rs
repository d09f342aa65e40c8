//! Page cache middleware.
//!
//! Runs once per request ahead of routing: prunes expired entries, then
//! serves eligible GET requests from the cache or captures the handler's
//! `200 OK` response for the next visitor.

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::backend::{InvalidationScope, StoredPage};
use super::handle::PageCacheHandle;
use super::keys::{BypassReason, RequestIdentity, SessionVars, check_eligibility};

const METRIC_HIT_TOTAL: &str = "pagecache_hit_total";
const METRIC_MISS_TOTAL: &str = "pagecache_miss_total";
const METRIC_STORE_TOTAL: &str = "pagecache_store_total";
const METRIC_BYPASS_TOTAL: &str = "pagecache_bypass_total";

pub const DEBUG_HEADER: &str = "x-page-cache";
pub const DEFAULT_ADMIN_PREFIX: &str = "/admin";
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// What the cache layer did with a request, attached to the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    /// Rendered by the handler and not stored.
    Miss,
    Stored,
    Bypass(BypassReason),
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Stored => "stored",
            Self::Bypass(_) => "bypass",
        }
    }

    pub fn reason(self) -> Option<BypassReason> {
        match self {
            Self::Bypass(reason) => Some(reason),
            _ => None,
        }
    }
}

fn tagged(mut response: Response, outcome: CacheOutcome) -> Response {
    response.extensions_mut().insert(outcome);
    response
}

/// Marks a request as belonging to the administrative interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminInterface;

/// Shared state for [`page_cache_layer`].
#[derive(Clone)]
pub struct PageCacheState {
    pub handle: PageCacheHandle,
    pub admin_prefix: String,
    pub max_body_bytes: usize,
}

impl PageCacheState {
    pub fn new(handle: PageCacheHandle) -> Self {
        Self {
            handle,
            admin_prefix: DEFAULT_ADMIN_PREFIX.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_admin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.admin_prefix = prefix.into();
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

/// Whole-segment prefix match; an empty prefix matches nothing.
fn is_admin_path(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(state): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cacher = state.handle.current();

    if let Err(err) = cacher.invalidate(InvalidationScope::ExpiredOnly).await {
        warn!(cache = "page", error = %err, "Expired entry pruning failed");
    }

    let path = request.uri().path().to_string();
    let admin = request.extensions().get::<AdminInterface>().is_some()
        || is_admin_path(&state.admin_prefix, &path);
    let decision = check_eligibility(request.method(), request.headers(), admin).and_then(|()| {
        if !cacher.has_cache() {
            Err(BypassReason::Unavailable)
        } else if !cacher.is_cacheable(&path) {
            Err(BypassReason::NotWhitelisted)
        } else {
            Ok(())
        }
    });
    if let Err(reason) = decision {
        debug!(cache = "page", outcome = "bypass", reason = reason.as_str());
        counter!(METRIC_BYPASS_TOTAL, "reason" => reason.as_str()).increment(1);
        return tagged(next.run(request).await, CacheOutcome::Bypass(reason));
    }

    let key = RequestIdentity::new(path)
        .with_query(request.uri().query())
        .with_session(request.extensions().get::<SessionVars>())
        .fingerprint();
    let debug_header = cacher.frontend().is_some_and(|frontend| frontend.debug_header());

    if let Some(page) = cacher.get(&key).await {
        debug!(cache = "page", outcome = "hit", key = %key);
        counter!(METRIC_HIT_TOTAL).increment(1);
        return tagged(build_response(page, debug_header), CacheOutcome::Hit);
    }

    debug!(cache = "page", outcome = "miss", key = %key);
    counter!(METRIC_MISS_TOTAL).increment(1);

    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return tagged(response, CacheOutcome::Miss);
    }

    if !fits_buffer(response.body(), state.max_body_bytes) {
        debug!(
            cache = "page",
            outcome = "bypass",
            reason = BypassReason::Size.as_str(),
            key = %key
        );
        counter!(METRIC_BYPASS_TOTAL, "reason" => BypassReason::Size.as_str()).increment(1);
        return tagged(response, CacheOutcome::Bypass(BypassReason::Size));
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(cache = "page", error = %err, "Failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut outcome = CacheOutcome::Miss;
    match cacher
        .store(&key, parts.status.as_u16(), content_type, bytes.clone())
        .await
    {
        Ok(true) => {
            outcome = CacheOutcome::Stored;
            debug!(cache = "page", outcome = "stored", key = %key, bytes = bytes.len());
            counter!(METRIC_STORE_TOTAL).increment(1);
            if debug_header {
                parts
                    .headers
                    .insert(DEBUG_HEADER, HeaderValue::from_static("stored"));
            }
        }
        Ok(false) => {}
        Err(err) => warn!(cache = "page", key = %key, error = %err, "Failed to store page"),
    }

    tagged(Response::from_parts(parts, Body::from(bytes)), outcome)
}

/// Only bodies with a known upper bound within `limit` are buffered.
fn fits_buffer(body: &Body, limit: usize) -> bool {
    body.size_hint()
        .upper()
        .is_some_and(|upper| usize::try_from(upper).is_ok_and(|upper| upper <= limit))
}

fn build_response(page: StoredPage, debug_header: bool) -> Response {
    let mut builder = Response::builder().status(page.status);
    if let Some(value) = page
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        builder = builder.header(header::CONTENT_TYPE, value);
    }
    if debug_header {
        builder = builder.header(DEBUG_HEADER, HeaderValue::from_static("hit"));
    }

    builder
        .body(Body::from(page.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
