use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Router, body::Body, http::Request, middleware, routing::get};
use pagecache::cache::{
    CacheEnvironment, MemoryOptionStore, PageCacheHandle, PageCacheState, RequestIdentity,
    page_cache_layer,
};
use tempfile::TempDir;
use tower::ServiceExt;

async fn body_of(app: &Router, uri: &str) -> String {
    let request = Request::builder().uri(uri).body(Body::empty()).expect("request");
    let response = app.clone().oneshot(request).await.expect("router should respond");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_misses_leave_one_complete_entry() {
    let dir = TempDir::new().expect("tempdir");
    let env = CacheEnvironment::new(
        Arc::new(MemoryOptionStore::new()),
        format!("{}/", dir.path().display()),
    );
    let handle = PageCacheHandle::open(env).await;

    let renders = Arc::new(AtomicUsize::new(0));
    let counter = renders.clone();
    let app = Router::new()
        .route(
            "/items",
            get(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    format!("render {n} {}", "x".repeat(64 * 1024))
                }
            }),
        )
        .layer(middleware::from_fn_with_state(
            PageCacheState::new(handle.clone()),
            page_cache_layer,
        ));

    let (first, second) = tokio::join!(body_of(&app, "/items"), body_of(&app, "/items"));
    assert_eq!(renders.load(Ordering::SeqCst), 2);

    let third = body_of(&app, "/items").await;
    assert_eq!(renders.load(Ordering::SeqCst), 2);
    assert!(third == first || third == second);

    let stored = handle
        .current()
        .get(&RequestIdentity::new("/items").fingerprint())
        .await
        .expect("entry should be readable");
    assert_eq!(stored.body.len(), third.len());

    let mut entries = tokio::fs::read_dir(dir.path()).await.expect("read cache dir");
    let mut files = 0;
    while let Some(entry) = entries.next_entry().await.expect("entry") {
        if entry.file_type().await.expect("file type").is_file() {
            files += 1;
        }
    }
    assert_eq!(files, 1);
}
