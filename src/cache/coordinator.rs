//! Record-change driven invalidation.
//!
//! After a record is inserted, updated or deleted, every registered
//! [`BlacklistContributor`] may propose rules for it (typically blacklisting
//! the record's detail page). Proposals are merged into the contributed
//! blacklist, which is saved when it changed; with automatic clearing on, the
//! whole cache is then flushed. Nothing here can fail the record change
//! itself: contributor and backend failures are logged and skipped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::backend::InvalidationScope;
use super::events::{RecordAction, RecordChange, RecordRef, UnknownRecordAction};
use super::handle::PageCacheHandle;
use super::rules::RuleMap;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ContributorError(pub String);

impl ContributorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Proposes blacklist rules for a changed record.
#[async_trait]
pub trait BlacklistContributor: Send + Sync {
    fn name(&self) -> &str;

    async fn propose_rules(
        &self,
        record: &RecordRef,
        action: RecordAction,
    ) -> Result<RuleMap, ContributorError>;
}

/// What handling one change did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationOutcome {
    pub proposed: usize,
    pub blacklist_changed: bool,
    pub flushed: bool,
}

pub struct InvalidationCoordinator {
    handle: PageCacheHandle,
    contributors: Vec<Arc<dyn BlacklistContributor>>,
}

impl InvalidationCoordinator {
    pub fn new(handle: PageCacheHandle) -> Self {
        Self {
            handle,
            contributors: Vec::new(),
        }
    }

    pub fn with_contributor(mut self, contributor: Arc<dyn BlacklistContributor>) -> Self {
        self.contributors.push(contributor);
        self
    }

    /// Entry point for the host's change notifications.
    pub async fn notify(
        &self,
        record: RecordRef,
        action: &str,
    ) -> Result<InvalidationOutcome, UnknownRecordAction> {
        let action: RecordAction = action.parse()?;
        Ok(self.on_record_changed(&RecordChange::new(record, action)).await)
    }

    #[instrument(skip_all, fields(change_id = %change.id, record = %change.record, action = %change.action))]
    pub async fn on_record_changed(&self, change: &RecordChange) -> InvalidationOutcome {
        let mut outcome = InvalidationOutcome::default();
        let cacher = self.handle.current();

        let mut proposals = RuleMap::new();
        for contributor in &self.contributors {
            match contributor.propose_rules(&change.record, change.action).await {
                Ok(rules) => {
                    debug!(contributor = contributor.name(), rules = rules.len(), "Blacklist proposal received");
                    proposals.merge(&rules);
                }
                Err(err) => warn!(
                    contributor = contributor.name(),
                    error = %err,
                    "Blacklist contributor failed; continuing"
                ),
            }
        }
        outcome.proposed = proposals.len();

        match cacher.merge_plugins_blacklist(&proposals).await {
            Ok(changed) => outcome.blacklist_changed = changed,
            Err(err) => warn!(error = %err, "Failed to save contributed blacklist"),
        }

        if cacher.auto_invalidate() && cacher.has_cache() {
            match cacher.invalidate(InvalidationScope::All).await {
                Ok(removed) => {
                    outcome.flushed = true;
                    info!(removed, "Page cache flushed after record change");
                }
                Err(err) => warn!(error = %err, "Page cache flush after record change failed"),
            }
        }

        outcome
    }
}
