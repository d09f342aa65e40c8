//! In-process content used by the demo site.
//!
//! Items and collections stand in for the host's records. Every mutation
//! goes through [`ContentStore`] and is followed by a record-change
//! notification from the admin router.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::lock::{read_guard, write_guard};
use crate::cache::{
    BlacklistContributor, ContributorError, PatternPolicy, RecordAction, RecordRef, RuleMap,
};

const SOURCE: &str = "infra::content";
const ITEM: &str = "Item";
const COLLECTION: &str = "Collection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Item,
    Collection,
}

impl ContentKind {
    pub fn record_type(self) -> &'static str {
        match self {
            Self::Item => ITEM,
            Self::Collection => COLLECTION,
        }
    }

    /// Public path segment, e.g. `items` in `/items/show/7`.
    pub fn segment(self) -> &'static str {
        match self {
            Self::Item => "items",
            Self::Collection => "collections",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "items" => Some(Self::Item),
            "collections" => Some(Self::Collection),
            _ => None,
        }
    }

    fn for_record(record: &RecordRef) -> Option<Self> {
        [Self::Item, Self::Collection]
            .into_iter()
            .find(|kind| record.is(kind.record_type()))
    }

    pub fn detail_path(self, id: u64) -> String {
        format!("/{}/show/{id}", self.segment())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: u64,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Default)]
pub struct ContentStore {
    records: RwLock<BTreeMap<(ContentKind, u64), ContentRecord>>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record. Returns which of the two happened.
    pub fn upsert(&self, kind: ContentKind, record: ContentRecord) -> RecordAction {
        let mut records = write_guard(&self.records, SOURCE, "upsert");
        match records.insert((kind, record.id), record) {
            Some(_) => RecordAction::Update,
            None => RecordAction::Insert,
        }
    }

    pub fn remove(&self, kind: ContentKind, id: u64) -> Option<ContentRecord> {
        write_guard(&self.records, SOURCE, "remove").remove(&(kind, id))
    }

    pub fn get(&self, kind: ContentKind, id: u64) -> Option<ContentRecord> {
        read_guard(&self.records, SOURCE, "get")
            .get(&(kind, id))
            .cloned()
    }

    pub fn list(&self, kind: ContentKind) -> Vec<ContentRecord> {
        read_guard(&self.records, SOURCE, "list")
            .iter()
            .filter(|((record_kind, _), _)| *record_kind == kind)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

/// Blacklists the detail page of a changed item or collection.
#[derive(Debug, Default)]
pub struct ContentPagesContributor;

#[async_trait]
impl BlacklistContributor for ContentPagesContributor {
    fn name(&self) -> &str {
        "content_pages"
    }

    async fn propose_rules(
        &self,
        record: &RecordRef,
        _action: RecordAction,
    ) -> Result<RuleMap, ContributorError> {
        let Some(kind) = ContentKind::for_record(record) else {
            return Ok(RuleMap::new());
        };
        Ok([PatternPolicy::forbid(format!("{}$", kind.detail_path(record.id)))]
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, title: &str) -> ContentRecord {
        ContentRecord {
            id,
            title: title.to_string(),
            body: String::new(),
        }
    }

    #[test]
    fn upsert_reports_insert_then_update() {
        let store = ContentStore::new();
        assert_eq!(store.upsert(ContentKind::Item, record(1, "Map")), RecordAction::Insert);
        assert_eq!(store.upsert(ContentKind::Item, record(1, "Atlas")), RecordAction::Update);
        assert_eq!(store.upsert(ContentKind::Collection, record(1, "Maps")), RecordAction::Insert);

        assert_eq!(store.list(ContentKind::Item).len(), 1);
        assert_eq!(store.get(ContentKind::Item, 1).map(|r| r.title), Some("Atlas".to_string()));
        assert!(store.remove(ContentKind::Item, 1).is_some());
        assert!(store.get(ContentKind::Item, 1).is_none());
    }

    #[tokio::test]
    async fn contributor_targets_detail_page_only() {
        let rules = ContentPagesContributor
            .propose_rules(&RecordRef::new(ITEM, 42), RecordAction::Delete)
            .await
            .expect("rules");
        assert!(rules.contains("/items/show/42$"));

        let set = crate::cache::RuleSet::build(
            &crate::cache::rules::default_whitelist(),
            &RuleMap::new(),
            &rules,
        );
        assert!(!set.is_cacheable("/items/show/42"));
        assert!(set.is_cacheable("/items/show/420"));

        let none = ContentPagesContributor
            .propose_rules(&RecordRef::new("User", 1), RecordAction::Update)
            .await
            .expect("rules");
        assert!(none.is_empty());
    }
}
