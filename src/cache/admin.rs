//! Administrative commands: clear cache, update configuration, uninstall.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::backend::InvalidationScope;
use super::engine::PageCacher;
use super::error::CacheError;
use super::handle::PageCacheHandle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminError {
    /// A submitted value was rejected; nothing was saved.
    #[error("invalid value for `{field}`: {reason}")]
    Validation { field: String, reason: String },
    /// Options were saved, but the reloaded engine has no usable backend.
    #[error("cache could not be initialized: {0}")]
    Initialization(CacheError),
    #[error(transparent)]
    Cache(CacheError),
}

impl From<CacheError> for AdminError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Cache(other),
        }
    }
}

#[derive(Clone)]
pub struct CacheAdmin {
    handle: PageCacheHandle,
}

impl CacheAdmin {
    pub fn new(handle: PageCacheHandle) -> Self {
        Self { handle }
    }

    /// Admin for one-off maintenance runs: pages are neither served nor
    /// stored, cleaning still works.
    pub fn for_maintenance(handle: PageCacheHandle) -> Self {
        if let Some(frontend) = handle.current().frontend() {
            frontend.set_caching(false);
        }
        Self { handle }
    }

    pub fn handle(&self) -> &PageCacheHandle {
        &self.handle
    }

    /// Flushes every cached page. Without a backend this does nothing.
    pub async fn clear_cache(&self) -> Result<usize, AdminError> {
        let removed = self.handle.current().invalidate(InvalidationScope::All).await?;
        info!(removed, "Page cache cleared by administrator");
        Ok(removed)
    }

    /// Validates and saves submitted options, then reloads the engine.
    ///
    /// A reloaded engine with a backend is fully cleaned; a failed clean is
    /// kept in its error list since the options are already saved. One
    /// without a backend reports the first error collected while
    /// initializing it.
    pub async fn update_configuration<'a, I>(&self, pairs: I) -> Result<Arc<PageCacher>, AdminError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.handle.current().save_options(pairs).await?;

        let reloaded = self.handle.force_reload().await;
        if reloaded.has_cache() {
            if let Err(err) = reloaded.invalidate(InvalidationScope::All).await {
                warn!(error = %err, "Page cache clean after configuration update failed");
            }
            info!(backend = %reloaded.backend_kind(), "Page cache configuration updated");
            return Ok(reloaded);
        }

        match reloaded.first_error() {
            Some(err) => {
                warn!(error = %err, "Page cache unavailable after configuration update");
                Err(AdminError::Initialization(err))
            }
            None => Ok(reloaded),
        }
    }

    /// Cleans the cache and deletes the persisted options.
    pub async fn uninstall(&self) -> Result<(), AdminError> {
        let cacher = self.handle.current();
        if let Err(err) = cacher.invalidate(InvalidationScope::All).await {
            warn!(error = %err, "Failed to clean page cache during uninstall");
        }
        cacher.delete_options().await?;
        info!("Page cache options deleted");
        Ok(())
    }
}
