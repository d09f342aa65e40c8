use axum::{
    Form, Json,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::info;

use crate::cache::{BackendKind, PageCacher, options::keys};
use crate::infra::http::error::HttpError;

use super::AdminState;

const SOURCE: &str = "infra::http::admin::cache";
/// Unchecked boxes are left out of a submitted form entirely.
const CHECKBOXES: [&str; 2] = [keys::ENABLE_DEBUGGING, keys::AUTO_CLEAR];

/// What the admin configuration form shows.
#[derive(Debug, Serialize)]
pub(super) struct PageCacheView {
    has_cache: bool,
    errors: Vec<String>,
    enable_debugging: bool,
    cache_lifetime: u64,
    automatically_clear_cache_after_record_change: bool,
    admin_blacklist_text: String,
    cache_dir_path: String,
    backend_name: BackendKind,
    plugins_blacklist: Vec<String>,
}

impl PageCacheView {
    fn from_cacher(cacher: &PageCacher) -> Self {
        let options = cacher.options();
        Self {
            has_cache: cacher.has_cache(),
            errors: cacher.errors().iter().map(ToString::to_string).collect(),
            enable_debugging: options.enable_debugging,
            cache_lifetime: options.cache_lifetime,
            automatically_clear_cache_after_record_change: options
                .automatically_clear_cache_after_record_change,
            admin_blacklist_text: options.admin_blacklist_text(),
            cache_dir_path: options.cache_dir_path.clone(),
            backend_name: options.backend_name,
            plugins_blacklist: options.plugins_blacklist.patterns().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ClearedView {
    removed: usize,
}

pub(super) async fn page_cache_settings(State(state): State<AdminState>) -> Response {
    let cacher = state.cache.handle().current();
    Json(PageCacheView::from_cacher(&cacher)).into_response()
}

pub(super) async fn update_page_cache_settings(
    State(state): State<AdminState>,
    Form(mut fields): Form<Vec<(String, String)>>,
) -> Result<Response, HttpError> {
    for checkbox in CHECKBOXES {
        if !fields.iter().any(|(key, _)| key == checkbox) {
            fields.push((checkbox.to_string(), "0".to_string()));
        }
    }
    let pairs = fields
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()));

    let cacher = state
        .cache
        .update_configuration(pairs)
        .await
        .map_err(|err| HttpError::from_admin(SOURCE, &err))?;
    Ok(Json(PageCacheView::from_cacher(&cacher)).into_response())
}

pub(super) async fn clear_page_cache(
    State(state): State<AdminState>,
) -> Result<Response, HttpError> {
    let removed = state
        .cache
        .clear_cache()
        .await
        .map_err(|err| HttpError::from_admin(SOURCE, &err))?;
    info!(target: "pagecache::http::admin::cache", removed, "Page cache cleared");
    Ok(Json(ClearedView { removed }).into_response())
}
