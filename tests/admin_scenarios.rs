use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header::CONTENT_TYPE},
};
use pagecache::{
    cache::{
        CacheAdmin, CacheEnvironment, DEBUG_HEADER, InvalidationCoordinator, MemoryOptionStore,
        PageCacheHandle, PageCacheState, PageCacher,
    },
    infra::{
        content::{ContentPagesContributor, ContentStore},
        http::{AdminState, HttpState, SESSION_USER_HEADER, build_admin_router, build_router},
    },
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

struct Site {
    _dir: TempDir,
    handle: PageCacheHandle,
    public: Router,
    admin: Router,
}

async fn site() -> Site {
    let dir = TempDir::new().expect("tempdir");
    let env = Arc::new(CacheEnvironment::new(
        Arc::new(MemoryOptionStore::new()),
        format!("{}/", dir.path().display()),
    ));
    PageCacher::install(env.clone()).await.expect("install");
    let handle = PageCacheHandle::from_cacher(env.clone(), PageCacher::open(env).await);

    let content = Arc::new(ContentStore::new());
    let coordinator = InvalidationCoordinator::new(handle.clone())
        .with_contributor(Arc::new(ContentPagesContributor));
    let cache_state = PageCacheState::new(handle.clone());

    let public = build_router(
        HttpState {
            content: content.clone(),
        },
        cache_state.clone(),
    );
    let admin = build_admin_router(
        AdminState {
            cache: CacheAdmin::new(handle.clone()),
            coordinator: Arc::new(coordinator),
            content,
        },
        cache_state,
    );

    Site {
        _dir: dir,
        handle,
        public,
        admin,
    }
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
    let response = app.clone().oneshot(request).await.expect("router should respond");
    let status = response.status();
    let marker = response
        .headers()
        .get(DEBUG_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, marker, String::from_utf8(bytes.to_vec()).expect("utf-8"))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

fn form(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn json(method: Method, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn parse(body: &str) -> Value {
    serde_json::from_str(body).expect("json body")
}

#[tokio::test]
async fn configuration_form_updates_rules_and_clears() {
    let site = site().await;

    call(&site.public, get("/items")).await;
    assert!(!site.handle.current().cache_directory_is_empty().await);

    let (status, _, body) = call(
        &site.admin,
        form(
            "/page-cache/config",
            "enable_debugging=1&cache_lifetime=3600&admin_blacklist_text=items%2Fbrowse%0A%2Fsearch",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let view = parse(&body);
    assert_eq!(view["cache_lifetime"], 3600);
    assert_eq!(view["enable_debugging"], true);
    assert_eq!(view["admin_blacklist_text"], "/items/browse\n/search");
    assert_eq!(view["has_cache"], true);

    assert!(site.handle.current().cache_directory_is_empty().await);
    let cacher = site.handle.current();
    assert!(!cacher.is_cacheable("/items/browse"));
    assert!(cacher.is_cacheable("/items"));

    let (_, marker, _) = call(&site.public, get("/items")).await;
    assert_eq!(marker.as_deref(), Some("stored"));
    let (_, marker, _) = call(&site.public, get("/items/browse")).await;
    assert_eq!(marker, None);
}

#[tokio::test]
async fn invalid_settings_are_rejected_without_saving() {
    let site = site().await;

    let (status, _, body) = call(
        &site.admin,
        form("/page-cache/config", "cache_lifetime=soon&enable_debugging=1"),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(parse(&body)["detail"].as_str().is_some_and(|d| d.contains("cache_lifetime")));

    let (_, _, body) = call(&site.admin, get("/page-cache")).await;
    let view = parse(&body);
    assert_eq!(view["enable_debugging"], false);
    assert_eq!(view["cache_lifetime"], 7200);
}

#[tokio::test]
async fn missing_cache_directory_reports_unavailable() {
    let site = site().await;

    let (status, _, body) = call(
        &site.admin,
        form("/page-cache/config", "cache_dir_path=%2Fdefinitely%2Fnot%2Fhere"),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(parse(&body)["detail"].as_str().is_some());

    let (_, _, body) = call(&site.admin, get("/page-cache")).await;
    let view = parse(&body);
    assert_eq!(view["has_cache"], false);
    assert_eq!(view["cache_dir_path"], "/definitely/not/here/");
    assert_eq!(view["errors"].as_array().map(Vec::len), Some(1));

    let (status, _, _) = call(&site.public, get("/")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn clear_cache_endpoint_reports_removed_entries() {
    let site = site().await;
    call(&site.public, get("/")).await;
    call(&site.public, get("/items")).await;

    let (status, _, body) = call(&site.admin, form("/page-cache/clear-cache", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["removed"], 2);
    assert!(site.handle.current().cache_directory_is_empty().await);
}

#[tokio::test]
async fn record_changes_flush_and_reset_contributed_rules() {
    let site = site().await;
    call(&site.public, get("/")).await;

    let (status, _, body) = call(
        &site.admin,
        json(Method::PUT, "/records/items/1", r#"{"title":"Atlas","body":"Old maps"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let change = parse(&body);
    assert_eq!(change["path"], "/items/show/1");
    assert_eq!(change["invalidation"]["proposed"], 1);
    assert_eq!(change["invalidation"]["blacklist_changed"], true);
    assert_eq!(change["invalidation"]["flushed"], true);

    // The full flush emptied the directory, which also drops contributed rules.
    let cacher = site.handle.current();
    assert!(cacher.cache_directory_is_empty().await);
    assert!(cacher.options().plugins_blacklist.is_empty());

    let (_, _, listing) = call(&site.public, get("/items")).await;
    assert!(listing.contains("Atlas"));

    let (status, _, body) = call(
        &site.admin,
        json(Method::PUT, "/records/items/1", r#"{"title":"Atlas, revised"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["invalidation"]["flushed"], true);
    let (_, _, listing) = call(&site.public, get("/items")).await;
    assert!(listing.contains("Atlas, revised"));

    let (status, _, _) = call(
        &site.admin,
        Request::builder()
            .method(Method::DELETE)
            .uri("/records/items/1")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, listing) = call(&site.public, get("/items")).await;
    assert!(!listing.contains("Atlas"));
}

#[tokio::test]
async fn contributed_rules_persist_without_auto_clear() {
    let site = site().await;
    let (status, _, _) = call(
        &site.admin,
        form(
            "/page-cache/config",
            "automatically_clear_cache_after_record_change=0",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    call(&site.public, get("/items")).await;
    let (_, _, body) = call(
        &site.admin,
        json(Method::PUT, "/records/collections/4", r#"{"title":"Maps"}"#),
    )
    .await;
    let change = parse(&body);
    assert_eq!(change["path"], "/collections/show/4");
    assert_eq!(change["invalidation"]["blacklist_changed"], true);
    assert_eq!(change["invalidation"]["flushed"], false);

    let cacher = site.handle.current();
    assert!(!cacher.is_cacheable("/collections/show/4"));
    assert!(cacher.is_cacheable("/collections/show/40"));
    assert!(!cacher.cache_directory_is_empty().await);

    let (_, _, body) = call(&site.admin, get("/page-cache")).await;
    assert_eq!(
        parse(&body)["plugins_blacklist"],
        serde_json::json!(["/collections/show/4$"])
    );
}

#[tokio::test]
async fn record_routes_validate_input() {
    let site = site().await;

    let (status, _, _) = call(
        &site.admin,
        json(Method::PUT, "/records/widgets/1", r#"{"title":"Gear"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = call(
        &site.admin,
        json(Method::PUT, "/records/collections/1", r#"{"title":"   "}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _, _) = call(
        &site.admin,
        Request::builder()
            .method(Method::DELETE)
            .uri("/records/collections/9")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn signed_in_visitors_get_their_own_pages() {
    let site = site().await;
    call(
        &site.admin,
        form("/page-cache/config", "enable_debugging=1"),
    )
    .await;

    let signed_in = || {
        Request::builder()
            .uri("/items")
            .header(SESSION_USER_HEADER, "curator")
            .body(Body::empty())
            .expect("request")
    };

    let (_, marker, _) = call(&site.public, get("/items")).await;
    assert_eq!(marker.as_deref(), Some("stored"));
    let (_, marker, _) = call(&site.public, signed_in()).await;
    assert_eq!(marker.as_deref(), Some("stored"));
    let (_, marker, _) = call(&site.public, signed_in()).await;
    assert_eq!(marker.as_deref(), Some("hit"));
}

#[tokio::test]
async fn unchecked_boxes_turn_options_off() {
    let site = site().await;
    let (_, _, body) = call(
        &site.admin,
        form(
            "/page-cache/config",
            "enable_debugging=1&automatically_clear_cache_after_record_change=1",
        ),
    )
    .await;
    let view = parse(&body);
    assert_eq!(view["enable_debugging"], true);
    assert_eq!(view["automatically_clear_cache_after_record_change"], true);

    let (status, _, body) = call(&site.admin, form("/page-cache/config", "cache_lifetime=60")).await;
    assert_eq!(status, StatusCode::OK);
    let view = parse(&body);
    assert_eq!(view["cache_lifetime"], 60);
    assert_eq!(view["enable_debugging"], false);
    assert_eq!(view["automatically_clear_cache_after_record_change"], false);

    let (_, marker, _) = call(&site.public, get("/items")).await;
    assert_eq!(marker, None);
}
