//! Conflict records and resolution policies.

use crate::entity::{EntityPayload, EntityRef, EntityType};
use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// How a conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The local payload overwrites the remote one.
    LocalWins,
    /// The remote payload overwrites the local one.
    ServerWins,
    /// Field-level merge; falls back to last-write-wins for non-mergeable types.
    Merge,
    /// Whichever side has the later timestamp. Ties go to the server.
    #[default]
    LastWriteWins,
    /// A person picks the outcome.
    ManualReview,
}

/// Outcome recorded on a [`ConflictRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Local payload kept.
    LocalWins,
    /// Remote payload kept.
    ServerWins,
    /// Merged payload written.
    Merge,
    /// A person supplied a payload of their own.
    ManualReview,
    /// Waiting for a person.
    Pending,
}

/// Choice made by a person for a conflict awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManualChoice {
    /// Push the local payload.
    KeepLocal,
    /// Accept the server payload and drop the queued change.
    KeepServer,
    /// Push this payload instead.
    Custom(EntityPayload),
}

/// Record of a divergence between the replica and the remote store.
///
/// Terminal once `resolved_at` is set; only resolution ever changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Unique id.
    pub id: String,
    /// Queue item that hit the conflict.
    pub queue_item_id: Option<String>,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Timestamp of the local change.
    pub local_timestamp: Timestamp,
    /// Timestamp of the remote version.
    pub server_timestamp: Timestamp,
    /// Server version the local change was based on.
    pub base_version: Option<u64>,
    /// Server version found at conflict time.
    pub server_version: u64,
    /// Local snapshot; `None` for a local delete.
    pub local_data: Option<EntityPayload>,
    /// Remote snapshot; `None` if the remote copy is deleted.
    pub server_data: Option<EntityPayload>,
    /// Result of a merge, when one was computed.
    pub merged_data: Option<EntityPayload>,
    /// Fields changed on both sides.
    pub conflicting_fields: Vec<String>,
    /// Current outcome.
    pub resolution: Resolution,
    /// When the conflict was settled.
    pub resolved_at: Option<Timestamp>,
    /// Who settled it (`auto:<policy>` or a user id).
    pub resolved_by: Option<String>,
    /// When the conflict was detected.
    pub created_at: Timestamp,
}

impl ConflictRecord {
    /// Whether the record is terminal.
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// The entity in conflict.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.as_str())
    }
}
