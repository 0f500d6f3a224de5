//! Documents exchanged with the remote store.

use crate::entity::EntityPayload;
use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// A document as held by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    /// Document id, equal to the entity id.
    pub id: String,
    /// Server version, bumped on every write.
    pub version: u64,
    /// Server timestamp of the last write.
    pub updated_at: Timestamp,
    /// Tombstone flag.
    pub deleted: bool,
    /// Body; `None` for tombstones.
    pub data: Option<EntityPayload>,
}

/// Filter for listing a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    /// Only documents written strictly after this time.
    pub updated_after: Option<Timestamp>,
    /// Maximum number of documents.
    pub limit: Option<usize>,
}

impl ListFilter {
    /// Every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Documents written after `timestamp`.
    pub fn since(timestamp: Timestamp) -> Self {
        Self {
            updated_after: Some(timestamp),
            limit: None,
        }
    }

    /// Whether `doc` passes the time filter.
    pub fn matches(&self, doc: &RemoteDocument) -> bool {
        self.updated_after.map_or(true, |after| doc.updated_at > after)
    }
}
