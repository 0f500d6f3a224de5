//! Local mutations and the queue records that carry them to the remote store.

use crate::entity::{EntityPayload, EntityRef, EntityType};
use crate::error::{ProtocolError, ProtocolResult};
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// A new entity.
    Create,
    /// A change to an existing entity.
    Update,
    /// Removal of an entity.
    Delete,
}

impl Operation {
    /// Whether the operation carries a payload.
    pub fn has_payload(&self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueItemStatus {
    /// Waiting to be drained.
    Pending,
    /// Handed out in a batch, awaiting ack or nack.
    InFlight,
    /// Out of attempts, or parked behind a conflict.
    Failed,
}

/// A change requested by the host application.
///
/// Mutations are the only way callers touch replicated data; the queue turns
/// each one into a durable [`QueueItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Target entity type.
    pub entity_type: EntityType,
    /// Target entity id.
    pub entity_id: String,
    /// Kind of change.
    pub operation: Operation,
    /// New snapshot, absent for deletes.
    pub payload: Option<EntityPayload>,
    /// Client timestamp; the queue stamps the current time when absent.
    pub local_timestamp: Option<Timestamp>,
    /// Drained ahead of ordinary items and by emergency syncs.
    pub priority: bool,
}

impl Mutation {
    /// Creates a new entity.
    pub fn create(entity_id: impl Into<String>, payload: EntityPayload) -> Self {
        Self::with_payload(Operation::Create, entity_id, payload)
    }

    /// Replaces an entity's snapshot.
    pub fn update(entity_id: impl Into<String>, payload: EntityPayload) -> Self {
        Self::with_payload(Operation::Update, entity_id, payload)
    }

    /// Deletes an entity.
    pub fn delete(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation: Operation::Delete,
            payload: None,
            local_timestamp: None,
            priority: false,
        }
    }

    fn with_payload(operation: Operation, entity_id: impl Into<String>, payload: EntityPayload) -> Self {
        Self {
            entity_type: payload.entity_type(),
            entity_id: entity_id.into(),
            operation,
            payload: Some(payload),
            local_timestamp: None,
            priority: false,
        }
    }

    /// Pins the local timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.local_timestamp = Some(timestamp);
        self
    }

    /// Marks the mutation as priority.
    #[must_use]
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// The entity this mutation targets.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.as_str())
    }

    /// Checks that the operation and payload agree with each other.
    pub fn validate(&self) -> ProtocolResult<()> {
        EntityRef::check_id(&self.entity_id)?;
        match (&self.payload, self.operation.has_payload()) {
            (Some(payload), true) => payload.ensure_type(self.entity_type),
            (None, true) => Err(ProtocolError::InvalidMutation(format!(
                "{:?} of {} requires a payload",
                self.operation,
                self.entity_ref()
            ))),
            (Some(_), false) => Err(ProtocolError::InvalidMutation(format!(
                "delete of {} must not carry a payload",
                self.entity_ref()
            ))),
            (None, false) => Ok(()),
        }
    }
}

/// A durable, pending mutation in the change queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item id.
    pub id: String,
    /// Monotonic enqueue sequence, breaks timestamp ties.
    pub seq: u64,
    /// Target entity type.
    pub entity_type: EntityType,
    /// Target entity id.
    pub entity_id: String,
    /// Kind of change.
    pub operation: Operation,
    /// Snapshot to send.
    pub payload: Option<EntityPayload>,
    /// Server version this change was made against; `None` if never synced.
    pub base_version: Option<u64>,
    /// Server snapshot this change was made against.
    pub base_payload: Option<EntityPayload>,
    /// When the change was made on the device.
    pub local_timestamp: Timestamp,
    /// Failed delivery attempts so far.
    pub attempt_count: u32,
    /// Priority flag.
    pub priority: bool,
    /// Lifecycle state.
    pub status: QueueItemStatus,
    /// Earliest time the item may be handed out again.
    pub next_attempt_at: Timestamp,
    /// Reason of the last failure.
    pub last_error: Option<String>,
    /// Conflict this item is parked behind.
    pub conflict_id: Option<String>,
    /// Encoded size of the payload, used for batch sizing.
    pub payload_size: u64,
}

impl QueueItem {
    /// The entity this item targets.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.as_str())
    }

    /// Whether the item waits on a manual conflict decision.
    pub fn is_parked(&self) -> bool {
        self.status == QueueItemStatus::Failed && self.conflict_id.is_some()
    }

    /// Ordering key within an entity.
    pub fn order_key(&self) -> (Timestamp, u64) {
        (self.local_timestamp, self.seq)
    }
}

/// Read-only summary of the change queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// All items.
    pub total_items: usize,
    /// Items waiting to be drained.
    pub pending_items: usize,
    /// Items handed out in the current batch.
    pub in_flight_items: usize,
    /// Failed or parked items.
    pub failed_items: usize,
    /// Local timestamp of the oldest item.
    pub oldest_item: Option<Timestamp>,
    /// Rough drain time for the pending items given the last throughput hint.
    pub estimated_sync_millis: Option<u64>,
    /// Encoded payload bytes held by the queue.
    pub queue_size_bytes: u64,
    /// Item count per entity type.
    pub items_by_type: BTreeMap<EntityType, usize>,
    /// Items flagged as priority.
    pub priority_items: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Feeding, Medication};

    fn feeding() -> EntityPayload {
        EntityPayload::Feeding(Feeding {
            dog_id: "rex".into(),
            product_id: None,
            amount_grams: 100,
            fed_at: 1,
            notes: None,
        })
    }

    #[test]
    fn constructors_take_type_from_payload() {
        let m = Mutation::update("7", feeding()).with_timestamp(42).with_priority(true);
        assert_eq!(m.entity_type, EntityType::Feeding);
        assert_eq!(m.local_timestamp, Some(42));
        assert!(m.priority);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inconsistent_mutations() {
        let mut m = Mutation::update("7", feeding());
        m.payload = None;
        assert!(m.validate().is_err());

        let mut d = Mutation::delete(EntityType::Feeding, "7");
        assert!(d.validate().is_ok());
        d.payload = Some(feeding());
        assert!(d.validate().is_err());

        let mut wrong = Mutation::update("3", feeding());
        wrong.entity_type = EntityType::Medication;
        assert!(matches!(
            wrong.validate(),
            Err(ProtocolError::TypeMismatch { .. })
        ));

        let blank = Mutation::create(
            " ",
            EntityPayload::Medication(Medication {
                dog_id: "rex".into(),
                name: "x".into(),
                dosage: "5mg".into(),
                frequency: "daily".into(),
                start_date: None,
                end_date: None,
                active: true,
            }),
        );
        assert!(blank.validate().is_err());

        let padded = Mutation::create("rex ", feeding());
        assert_eq!(
            padded.validate(),
            Err(ProtocolError::InvalidEntityId("rex ".into()))
        );
    }
}
