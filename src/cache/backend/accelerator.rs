//! Bounded in-process accelerator store.
//!
//! Entries are evicted least-recently-used once `slots` is reached. Wiping
//! the whole store is an administrative operation and needs the configured
//! credentials.

use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;

use super::{BackendKind, InvalidationScope, PageBackend, StoredPage};
use crate::cache::config::XcacheSettings;
use crate::cache::error::CacheError;
use crate::cache::keys::Fingerprint;
use crate::cache::lock::mutex_guard;

const SOURCE: &str = "cache::backend::accelerator";

pub struct AcceleratorBackend {
    entries: Mutex<LruCache<Fingerprint, StoredPage>>,
    user: Option<String>,
    password: Option<String>,
}

impl AcceleratorBackend {
    pub fn new(settings: XcacheSettings) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(settings.slots)),
            user: settings.user,
            password: settings.password,
        }
    }

    fn has_credentials(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.user) && present(&self.password)
    }
}

#[async_trait]
impl PageBackend for AcceleratorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpaqueAccelerator
    }

    async fn load(&self, key: &Fingerprint) -> Result<Option<StoredPage>, CacheError> {
        Ok(mutex_guard(&self.entries, SOURCE, "load").get(key).cloned())
    }

    async fn save(&self, key: &Fingerprint, page: &StoredPage) -> Result<(), CacheError> {
        mutex_guard(&self.entries, SOURCE, "save").put(key.clone(), page.clone());
        Ok(())
    }

    async fn clean(&self, scope: InvalidationScope) -> Result<usize, CacheError> {
        let mut entries = mutex_guard(&self.entries, SOURCE, "clean");
        match scope {
            InvalidationScope::All => {
                if !self.has_credentials() {
                    return Err(CacheError::backend(
                        self.kind().as_str(),
                        "clean",
                        "administrative user and password are required to clear the store",
                    ));
                }
                let removed = entries.len();
                entries.clear();
                Ok(removed)
            }
            InvalidationScope::ExpiredOnly => {
                let expired: Vec<Fingerprint> = entries
                    .iter()
                    .filter(|(_, page)| page.is_expired())
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &expired {
                    entries.pop(key);
                }
                Ok(expired.len())
            }
        }
    }
}
