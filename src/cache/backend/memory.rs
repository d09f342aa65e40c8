use async_trait::async_trait;
use dashmap::DashMap;

use super::{BackendKind, InvalidationScope, PageBackend, StoredPage};
use crate::cache::error::CacheError;
use crate::cache::keys::Fingerprint;

/// Shared in-process store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<Fingerprint, StoredPage>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InMemoryShared
    }

    async fn load(&self, key: &Fingerprint) -> Result<Option<StoredPage>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn save(&self, key: &Fingerprint, page: &StoredPage) -> Result<(), CacheError> {
        self.entries.insert(key.clone(), page.clone());
        Ok(())
    }

    async fn clean(&self, scope: InvalidationScope) -> Result<usize, CacheError> {
        let before = self.entries.len();
        match scope {
            InvalidationScope::All => self.entries.clear(),
            InvalidationScope::ExpiredOnly => self.entries.retain(|_, page| !page.is_expired()),
        }
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn page(expires_at: Option<i64>) -> StoredPage {
        StoredPage {
            status: 200,
            content_type: Some("text/html".to_string()),
            body: Bytes::from_static(b"ok"),
            created_at: 0,
            expires_at,
        }
    }

    #[tokio::test]
    async fn expired_clean_keeps_live_entries() {
        let backend = MemoryBackend::new();
        let live = Fingerprint::from_hex("aa");
        let stale = Fingerprint::from_hex("bb");
        backend.save(&live, &page(None)).await.expect("save");
        backend.save(&stale, &page(Some(1))).await.expect("save");

        let removed = backend.clean(InvalidationScope::ExpiredOnly).await.expect("clean");
        assert_eq!(removed, 1);
        assert!(backend.load(&live).await.expect("load").is_some());
        assert!(backend.load(&stale).await.expect("load").is_none());

        assert_eq!(backend.clean(InvalidationScope::All).await.expect("clean"), 1);
        assert!(backend.is_empty());
    }
}
