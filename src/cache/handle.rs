use std::sync::{Arc, RwLock};

use tracing::info;

use super::engine::{CacheEnvironment, PageCacher};
use super::lock::{read_guard, write_guard};

const SOURCE: &str = "cache::handle";

/// Scope-owned access to the current engine.
///
/// Built once when the application is composed and shared with the request
/// pipeline, the coordinator and the admin surface. [`force_reload`] swaps in
/// a freshly loaded engine; requests already holding the old one finish with it.
///
/// [`force_reload`]: PageCacheHandle::force_reload
#[derive(Clone)]
pub struct PageCacheHandle {
    env: Arc<CacheEnvironment>,
    current: Arc<RwLock<Arc<PageCacher>>>,
}

impl PageCacheHandle {
    /// Loads options and initializes the backend.
    pub async fn open(env: CacheEnvironment) -> Self {
        let env = Arc::new(env);
        let cacher = PageCacher::open(env.clone()).await;
        Self::from_cacher(env, cacher)
    }

    pub fn from_cacher(env: Arc<CacheEnvironment>, cacher: PageCacher) -> Self {
        Self {
            env,
            current: Arc::new(RwLock::new(Arc::new(cacher))),
        }
    }

    pub fn current(&self) -> Arc<PageCacher> {
        read_guard(&self.current, SOURCE, "current").clone()
    }

    pub fn environment(&self) -> &Arc<CacheEnvironment> {
        &self.env
    }

    /// Rebuilds the engine from persisted options and replaces the current one.
    pub async fn force_reload(&self) -> Arc<PageCacher> {
        let cacher = Arc::new(PageCacher::open(self.env.clone()).await);
        *write_guard(&self.current, SOURCE, "force_reload") = cacher.clone();
        info!(has_cache = cacher.has_cache(), "Page cache reloaded");
        cacher
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cache::options::{MemoryOptionStore, keys};

    #[tokio::test]
    async fn reload_picks_up_saved_options() {
        let dir = TempDir::new().expect("tempdir");
        let env = CacheEnvironment::new(
            Arc::new(MemoryOptionStore::new()),
            format!("{}/", dir.path().display()),
        );
        let handle = PageCacheHandle::open(env).await;
        let before = handle.current();
        assert!(before.has_cache());

        before
            .set_options([(keys::CACHE_LIFETIME, "60")])
            .expect("valid");
        before.save().await.expect("save");

        let after = handle.force_reload().await;
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&after, &handle.current()));
        assert_eq!(after.options().cache_lifetime, 60);
        assert_eq!(after.frontend().map(|frontend| frontend.lifetime()), Some(60));
    }
}
