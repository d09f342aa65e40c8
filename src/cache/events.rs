//! Record-change notifications.
//!
//! The host content system reports every insert, update and delete of a
//! record; the invalidation coordinator turns them into blacklist updates
//! and cache flushes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Insert,
    Update,
    Delete,
}

impl RecordAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for RecordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("`{0}` is not a record action (expected insert, update or delete)")]
pub struct UnknownRecordAction(pub String);

impl FromStr for RecordAction {
    type Err = UnknownRecordAction;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(UnknownRecordAction(value.to_string())),
        }
    }
}

/// Identifies a content record by type name and numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    /// Record type as the host names it, e.g. `Item` or `Collection`.
    pub record_type: String,
    pub id: u64,
}

impl RecordRef {
    pub fn new(record_type: impl Into<String>, id: u64) -> Self {
        Self {
            record_type: record_type.into(),
            id,
        }
    }

    /// Case-insensitive record type comparison.
    pub fn is(&self, record_type: &str) -> bool {
        self.record_type.eq_ignore_ascii_case(record_type)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.record_type, self.id)
    }
}

/// A single record-change notification.
#[derive(Debug, Clone)]
pub struct RecordChange {
    /// Unique identifier used to correlate log lines.
    pub id: Uuid,
    pub record: RecordRef,
    pub action: RecordAction,
    pub timestamp: OffsetDateTime,
}

impl RecordChange {
    pub fn new(record: RecordRef, action: RecordAction) -> Self {
        let change = Self {
            id: Uuid::new_v4(),
            record,
            action,
            timestamp: OffsetDateTime::now_utc(),
        };

        info!(
            change_id = %change.id,
            record = %change.record,
            action = %change.action,
            "Record change received"
        );

        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_case_insensitively() {
        assert_eq!("insert".parse(), Ok(RecordAction::Insert));
        assert_eq!("UPDATE".parse(), Ok(RecordAction::Update));
        assert_eq!(" Delete ".parse(), Ok(RecordAction::Delete));
        assert!("publish".parse::<RecordAction>().is_err());
    }

    #[test]
    fn record_type_comparison_ignores_case() {
        let record = RecordRef::new("Item", 42);
        assert!(record.is("item"));
        assert!(!record.is("collection"));
        assert_eq!(record.to_string(), "Item#42");
    }

    #[test]
    fn change_gets_unique_id() {
        let a = RecordChange::new(RecordRef::new("Item", 1), RecordAction::Insert);
        let b = RecordChange::new(RecordRef::new("Item", 1), RecordAction::Insert);
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_nil());
    }
}
