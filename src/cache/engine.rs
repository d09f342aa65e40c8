//! The page cache engine.
//!
//! [`PageCacher`] owns the cache options, the rule set derived from them and,
//! when initialization succeeded, a [`PageFrontend`] wrapping the selected
//! backend. Initialization and cleaning errors are collected on the engine
//! instead of being raised; a missing frontend simply means nothing is cached.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::backend::{
    self, BackendConfig, BackendKind, InvalidationScope, NodeFailureCallback, PageBackend,
    StoredPage,
};
use super::config::BackendSettings;
use super::error::CacheError;
use super::keys::Fingerprint;
use super::lock::{mutex_guard, read_guard, write_guard};
use super::options::{self, CacheOptions, OptionStore};
use super::rules::{RuleMap, RuleSet, WhitelistContributor, build_whitelist};

const SOURCE: &str = "cache::engine";
const METRIC_CLEAN_TOTAL: &str = "pagecache_clean_total";
const METRIC_CLEAN_MS: &str = "pagecache_clean_ms";

/// Everything an engine needs that outlives a reload.
pub struct CacheEnvironment {
    pub store: Arc<dyn OptionStore>,
    pub backend_settings: BackendSettings,
    /// Used whenever the stored directory is blank.
    pub default_directory: String,
    pub whitelist_contributors: Vec<Arc<dyn WhitelistContributor>>,
    pub on_node_failure: Option<NodeFailureCallback>,
}

impl CacheEnvironment {
    pub fn new(store: Arc<dyn OptionStore>, default_directory: impl Into<String>) -> Self {
        Self {
            store,
            backend_settings: BackendSettings::default(),
            default_directory: default_directory.into(),
            whitelist_contributors: Vec::new(),
            on_node_failure: None,
        }
    }

    pub fn with_backend_settings(mut self, settings: BackendSettings) -> Self {
        self.backend_settings = settings;
        self
    }

    pub fn with_whitelist_contributor(mut self, contributor: Arc<dyn WhitelistContributor>) -> Self {
        self.whitelist_contributors.push(contributor);
        self
    }

    pub fn with_node_failure_callback(mut self, callback: NodeFailureCallback) -> Self {
        self.on_node_failure = Some(callback);
        self
    }
}

/// Backend wrapper that applies the lifetime and the caching switch.
pub struct PageFrontend {
    backend: Arc<dyn PageBackend>,
    lifetime: u64,
    debug_header: bool,
    caching: AtomicBool,
    forced: AtomicUsize,
}

/// Keeps the frontend active until dropped.
pub struct ForcedCaching<'a> {
    frontend: &'a PageFrontend,
}

impl Drop for ForcedCaching<'_> {
    fn drop(&mut self) {
        self.frontend.forced.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PageFrontend {
    pub fn new(backend: Arc<dyn PageBackend>, lifetime: u64, debug_header: bool) -> Self {
        Self {
            backend,
            lifetime,
            debug_header,
            caching: AtomicBool::new(true),
            forced: AtomicUsize::new(0),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    pub fn debug_header(&self) -> bool {
        self.debug_header
    }

    /// Serving and storing stop while caching is switched off.
    ///
    /// Maintenance commands run with caching off; cleaning still happens
    /// through [`PageFrontend::force_caching`].
    pub fn set_caching(&self, enabled: bool) {
        self.caching.store(enabled, Ordering::SeqCst);
    }

    pub fn is_caching(&self) -> bool {
        self.caching.load(Ordering::SeqCst) || self.forced.load(Ordering::SeqCst) > 0
    }

    /// Turns caching on for as long as the guard lives; the switch itself is untouched.
    pub fn force_caching(&self) -> ForcedCaching<'_> {
        self.forced.fetch_add(1, Ordering::SeqCst);
        ForcedCaching { frontend: self }
    }

    /// A stored, unexpired page. Backend errors count as a miss.
    pub async fn load(&self, key: &Fingerprint) -> Option<StoredPage> {
        if !self.is_caching() {
            return None;
        }
        match self.backend.load(key).await {
            Ok(Some(page)) if !page.is_expired() => Some(page),
            Ok(_) => None,
            Err(err) => {
                warn!(backend = %self.backend.kind(), error = %err, "Cache lookup failed");
                None
            }
        }
    }

    /// Stores the page under the configured lifetime. Returns false when skipped.
    pub async fn save(
        &self,
        key: &Fingerprint,
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    ) -> Result<bool, CacheError> {
        if !self.is_caching() {
            return Ok(false);
        }
        let page = StoredPage::new(status, content_type, body, self.lifetime);
        self.backend.save(key, &page).await?;
        Ok(true)
    }

    pub async fn clean(&self, scope: InvalidationScope) -> Result<usize, CacheError> {
        if !self.is_caching() {
            return Ok(0);
        }
        self.backend.clean(scope).await
    }
}

/// Options, rules and backend for one process scope.
pub struct PageCacher {
    env: Arc<CacheEnvironment>,
    options: RwLock<CacheOptions>,
    rules: RwLock<Arc<RuleSet>>,
    whitelist: RuleMap,
    frontend: Option<PageFrontend>,
    errors: Mutex<Vec<CacheError>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl PageCacher {
    /// Builds an engine without a backend.
    ///
    /// When `load_options` is false the defaults are used. If the file
    /// backend's directory turns out empty, the contributed blacklist is
    /// reset and saved.
    pub async fn new(env: Arc<CacheEnvironment>, load_options: bool) -> Self {
        let options = if load_options {
            CacheOptions::load(env.store.as_ref(), &env.default_directory).await
        } else {
            CacheOptions::defaults(env.default_directory.clone())
        };
        let whitelist = build_whitelist(&env.whitelist_contributors);
        let rules = RuleSet::build(&whitelist, &options.admin_blacklist, &options.plugins_blacklist);

        let cacher = Self {
            env,
            options: RwLock::new(options),
            rules: RwLock::new(Arc::new(rules)),
            whitelist,
            frontend: None,
            errors: Mutex::new(Vec::new()),
            persist_lock: tokio::sync::Mutex::new(()),
        };

        if cacher.backend_kind().uses_directory() && cacher.cache_directory_is_empty().await {
            let reset = cacher.update(|options| options.reset_plugins_blacklist());
            if reset {
                debug!("Cache directory is empty; cleared contributed blacklist");
            }
            if let Err(err) = cacher.save().await {
                warn!(error = %err, "Failed to save cache options after blacklist reset");
            }
        }

        cacher
    }

    /// Loads options and connects the configured backend.
    pub async fn open(env: Arc<CacheEnvironment>) -> Self {
        let mut cacher = Self::new(env, true).await;
        cacher.initialize().await;
        cacher
    }

    /// Saves the default options.
    pub async fn install(env: Arc<CacheEnvironment>) -> Result<Self, CacheError> {
        let cacher = Self::new(env, false).await;
        cacher.save().await?;
        info!("Page cache installed with default options");
        Ok(cacher)
    }

    /// Connects the backend, recording the error and leaving the engine
    /// without one when that fails.
    pub async fn initialize(&mut self) -> bool {
        let (config, lifetime, debug_header) = {
            let options = read_guard(&self.options, SOURCE, "initialize");
            (
                BackendConfig::resolve(
                    options.backend_name,
                    &options.cache_directory_path(),
                    &self.env.backend_settings,
                ),
                options.cache_lifetime,
                options.enable_debugging,
            )
        };
        let kind = config.kind();

        match backend::connect(config, self.env.on_node_failure.clone()).await {
            Ok(backend) => {
                info!(backend = %kind, lifetime_secs = lifetime, "Page cache initialized");
                self.frontend = Some(PageFrontend::new(backend, lifetime, debug_header));
                true
            }
            Err(err) => {
                warn!(backend = %kind, error = %err, "Page cache disabled; backend initialization failed");
                self.record_error(err);
                self.frontend = None;
                false
            }
        }
    }

    pub fn environment(&self) -> &Arc<CacheEnvironment> {
        &self.env
    }

    pub fn has_cache(&self) -> bool {
        self.frontend.is_some()
    }

    pub fn frontend(&self) -> Option<&PageFrontend> {
        self.frontend.as_ref()
    }

    pub fn options(&self) -> CacheOptions {
        read_guard(&self.options, SOURCE, "options").clone()
    }

    pub fn backend_kind(&self) -> BackendKind {
        read_guard(&self.options, SOURCE, "backend_kind").backend_name
    }

    pub fn auto_invalidate(&self) -> bool {
        read_guard(&self.options, SOURCE, "auto_invalidate").automatically_clear_cache_after_record_change
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        read_guard(&self.rules, SOURCE, "rules").clone()
    }

    /// Whether `path` may be served from or stored into the cache.
    pub fn is_cacheable(&self, path: &str) -> bool {
        self.rules().is_cacheable(path)
    }

    /// Mutates the options and rebuilds the rule set. Not persisted.
    pub fn update<R>(&self, apply: impl FnOnce(&mut CacheOptions) -> R) -> R {
        let mut options = write_guard(&self.options, SOURCE, "update");
        let result = apply(&mut options);
        let rules = RuleSet::build(&self.whitelist, &options.admin_blacklist, &options.plugins_blacklist);
        *write_guard(&self.rules, SOURCE, "update") = Arc::new(rules);
        result
    }

    /// Applies admin form pairs atomically: nothing changes unless every value is valid.
    pub fn set_options<'a, I>(&self, pairs: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut candidate = self.options();
        candidate.set_options(pairs)?;
        self.update(|options| *options = candidate);
        Ok(())
    }

    /// Validates admin form pairs, persists them, then applies them.
    ///
    /// The live options only change once the store accepted the new record.
    pub async fn save_options<'a, I>(&self, pairs: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let _guard = self.persist_lock.lock().await;
        let mut candidate = self.options();
        candidate.set_options(pairs)?;
        candidate.save(self.env.store.as_ref()).await?;
        self.update(|options| *options = candidate);
        Ok(())
    }

    /// Merges contributed rules. Saves and returns true when anything changed.
    pub async fn merge_plugins_blacklist(&self, additions: &RuleMap) -> Result<bool, CacheError> {
        if additions.is_empty() {
            return Ok(false);
        }
        let changed = self.update(|options| options.merge_plugins_blacklist(additions));
        if changed {
            self.save().await?;
        }
        Ok(changed)
    }

    /// Persists the current options.
    pub async fn save(&self) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.options();
        snapshot.save(self.env.store.as_ref()).await
    }

    pub async fn delete_options(&self) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().await;
        CacheOptions::delete(self.env.store.as_ref()).await
    }

    /// A live page for `key`, if caching is available and it is stored.
    pub async fn get(&self, key: &Fingerprint) -> Option<StoredPage> {
        self.frontend.as_ref()?.load(key).await
    }

    /// Stores a captured response. No-op without a backend.
    pub async fn store(
        &self,
        key: &Fingerprint,
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    ) -> Result<bool, CacheError> {
        match self.frontend.as_ref() {
            Some(frontend) => frontend.save(key, status, content_type, body).await,
            None => Ok(false),
        }
    }

    /// Cleans the backend even when caching is switched off.
    ///
    /// A full clean also resets the contributed blacklist. Failures are
    /// recorded on the engine as well as returned.
    pub async fn invalidate(&self, scope: InvalidationScope) -> Result<usize, CacheError> {
        let Some(frontend) = self.frontend.as_ref() else {
            return Ok(0);
        };

        let started_at = Instant::now();
        let result = {
            let _forced = frontend.force_caching();
            frontend.clean(scope).await
        };
        histogram!(METRIC_CLEAN_MS, "scope" => scope.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        let removed = match result {
            Ok(removed) => removed,
            Err(err) => {
                warn!(scope = scope.as_str(), error = %err, "Page cache clean failed");
                self.record_error(err.clone());
                return Err(err);
            }
        };
        counter!(METRIC_CLEAN_TOTAL, "scope" => scope.as_str()).increment(1);

        if scope == InvalidationScope::All {
            self.update(|options| options.reset_plugins_blacklist());
            self.save().await?;
            info!(removed, "Page cache cleared");
        } else {
            if removed > 0 {
                debug!(removed, "Pruned expired cache entries");
            }
            if let Err(err) = self.reset_blacklist_if_directory_empty().await {
                warn!(error = %err, "Failed to save cache options after blacklist reset");
            }
        }

        Ok(removed)
    }

    /// Drops contributed rules once the file store is observed empty, which
    /// also catches a flush done outside this process.
    async fn reset_blacklist_if_directory_empty(&self) -> Result<bool, CacheError> {
        if !self.backend_kind().uses_directory()
            || read_guard(&self.options, SOURCE, "reset_blacklist").plugins_blacklist.is_empty()
            || !self.cache_directory_is_empty().await
        {
            return Ok(false);
        }
        let reset = self.update(|options| options.reset_plugins_blacklist());
        if reset {
            debug!("Cache directory is empty; cleared contributed blacklist");
            self.save().await?;
        }
        Ok(reset)
    }

    pub fn record_error(&self, err: CacheError) {
        mutex_guard(&self.errors, SOURCE, "record_error").push(err);
    }

    /// Collected errors, oldest first.
    pub fn errors(&self) -> Vec<CacheError> {
        mutex_guard(&self.errors, SOURCE, "errors").clone()
    }

    pub fn first_error(&self) -> Option<CacheError> {
        mutex_guard(&self.errors, SOURCE, "first_error").first().cloned()
    }

    pub fn cache_directory_path(&self) -> PathBuf {
        read_guard(&self.options, SOURCE, "cache_directory_path").cache_directory_path()
    }

    pub async fn cache_directory_exists(&self) -> bool {
        options::directory_exists(&self.cache_directory_path()).await
    }

    pub async fn cache_directory_is_readable_writable(&self) -> bool {
        options::directory_is_readable_writable(&self.cache_directory_path()).await
    }

    pub async fn cache_directory_is_empty(&self) -> bool {
        options::directory_is_empty(&self.cache_directory_path()).await
    }
}
