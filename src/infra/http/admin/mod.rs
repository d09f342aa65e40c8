mod cache;
mod records;
mod state;

pub use state::AdminState;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};

use crate::cache::{PageCacheState, page_cache_layer};

use super::middleware::{log_requests, mark_admin_interface};

/// Admin listener routes.
///
/// The page cache layer still runs here so expired entries are pruned on
/// every request, but every request is marked as admin traffic and bypasses it.
pub fn build_admin_router(state: AdminState, cache: PageCacheState) -> Router {
    Router::new()
        .route("/page-cache", get(cache::page_cache_settings))
        .route("/page-cache/config", post(cache::update_page_cache_settings))
        .route("/page-cache/clear-cache", post(cache::clear_page_cache))
        .route(
            "/records/{kind}/{id}",
            put(records::save_record).delete(records::delete_record),
        )
        .with_state(state)
        .layer(middleware::from_fn_with_state(cache, page_cache_layer))
        .layer(middleware::from_fn(mark_admin_interface))
        .layer(middleware::from_fn(log_requests))
}
