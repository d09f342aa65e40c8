use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{Request, StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::{
    cache::{PageCacheState, SessionVars, page_cache_layer},
    infra::content::{ContentKind, ContentRecord, ContentStore},
};

use super::middleware::log_requests;

const HTML: &str = "text/html; charset=utf-8";
/// Stand-in for the host's login session.
pub const SESSION_USER_HEADER: &str = "x-session-user";

#[derive(Clone)]
pub struct HttpState {
    pub content: Arc<ContentStore>,
}

/// Public site with the page cache in front of every route.
pub fn build_router(state: HttpState, cache: PageCacheState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/items", get(items_index))
        .route("/items/browse", get(items_index))
        .route("/items/show/{id}", get(item_detail))
        .route("/collections", get(collections_index))
        .route("/collections/browse", get(collections_index))
        .route("/collections/show/{id}", get(collection_detail))
        .route("/search", get(search))
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn_with_state(cache, page_cache_layer))
        .layer(middleware::from_fn(attach_session))
        .layer(middleware::from_fn(log_requests))
}

async fn attach_session(mut request: Request<Body>, next: Next) -> Response {
    let user = request
        .headers()
        .get(SESSION_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if let Some(user) = user {
        let mut session = SessionVars::default();
        session.insert("user", user);
        request.extensions_mut().insert(session);
    }
    next.run(request).await
}

async fn index(State(state): State<HttpState>) -> Response {
    let items = state.content.list(ContentKind::Item).len();
    let collections = state.content.list(ContentKind::Collection).len();
    html_page(
        "Home",
        &format!(
            "<p>{items} items in {collections} collections.</p>\
             <p><a href=\"/items/browse\">Browse items</a> · \
             <a href=\"/collections/browse\">Browse collections</a></p>"
        ),
    )
}

async fn items_index(State(state): State<HttpState>) -> Response {
    listing(&state, ContentKind::Item, "Items")
}

async fn collections_index(State(state): State<HttpState>) -> Response {
    listing(&state, ContentKind::Collection, "Collections")
}

async fn item_detail(State(state): State<HttpState>, Path(id): Path<u64>) -> Response {
    detail(&state, ContentKind::Item, id)
}

async fn collection_detail(State(state): State<HttpState>, Path(id): Path<u64>) -> Response {
    detail(&state, ContentKind::Collection, id)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchQuery {
    q: String,
}

async fn search(State(state): State<HttpState>, Query(query): Query<SearchQuery>) -> Response {
    let needle = query.q.trim().to_lowercase();
    let hits: Vec<(ContentKind, ContentRecord)> = [ContentKind::Item, ContentKind::Collection]
        .into_iter()
        .flat_map(|kind| {
            state
                .content
                .list(kind)
                .into_iter()
                .map(move |record| (kind, record))
        })
        .filter(|(_, record)| !needle.is_empty() && record.title.to_lowercase().contains(&needle))
        .collect();

    let list = hits
        .iter()
        .map(|(kind, record)| link_item(*kind, record))
        .collect::<String>();
    html_page(
        "Search",
        &format!("<p>{} results for “{}”</p><ul>{list}</ul>", hits.len(), escape(&query.q)),
    )
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(CONTENT_TYPE, HTML)],
        "<h1>Page not found</h1>",
    )
        .into_response()
}

fn listing(state: &HttpState, kind: ContentKind, title: &str) -> Response {
    let list = state
        .content
        .list(kind)
        .iter()
        .map(|record| link_item(kind, record))
        .collect::<String>();
    html_page(title, &format!("<ul>{list}</ul>"))
}

fn detail(state: &HttpState, kind: ContentKind, id: u64) -> Response {
    match state.content.get(kind, id) {
        Some(record) => html_page(&record.title, &format!("<p>{}</p>", escape(&record.body))),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn link_item(kind: ContentKind, record: &ContentRecord) -> String {
    format!(
        "<li><a href=\"{}\">{}</a></li>",
        kind.detail_path(record.id),
        escape(&record.title)
    )
}

fn html_page(title: &str, body: &str) -> Response {
    let title = escape(title);
    (
        [(CONTENT_TYPE, HTML)],
        format!(
            "<!doctype html><html><head><title>{title}</title></head>\
             <body><h1>{title}</h1>{body}</body></html>"
        ),
    )
        .into_response()
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
