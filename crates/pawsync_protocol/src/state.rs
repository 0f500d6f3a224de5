//! Persisted per-user sync state.

use crate::entity::EntityType;
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncType {
    /// Push everything, then pull everything.
    Full,
    /// Push, then pull what changed since the last sync.
    Incremental,
    /// Push and pull only the listed types.
    Selective(Vec<EntityType>),
    /// Push priority items only; no pull.
    Emergency,
    /// First sync of a device: pull everything, then push.
    Initial,
}

impl SyncType {
    /// Whether items of `entity_type` take part in this cycle.
    pub fn includes(&self, entity_type: EntityType) -> bool {
        match self {
            SyncType::Selective(types) => types.contains(&entity_type),
            _ => true,
        }
    }

    /// Whether this cycle pulls remote changes.
    pub fn pulls(&self) -> bool {
        !matches!(self, SyncType::Emergency)
    }

    /// Whether the pull covers every document rather than recent changes.
    pub fn pulls_everything(&self) -> bool {
        matches!(self, SyncType::Full | SyncType::Initial | SyncType::Selective(_))
    }

    /// Whether the pull happens before the push.
    pub fn pulls_first(&self) -> bool {
        matches!(self, SyncType::Initial)
    }

    /// Whether only priority items are pushed.
    pub fn priority_only(&self) -> bool {
        matches!(self, SyncType::Emergency)
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Full => f.write_str("full"),
            SyncType::Incremental => f.write_str("incremental"),
            SyncType::Selective(types) => {
                f.write_str("selective(")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{t}")?;
                }
                f.write_str(")")
            }
            SyncType::Emergency => f.write_str("emergency"),
            SyncType::Initial => f.write_str("initial"),
        }
    }
}

/// The sync state singleton of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStateRecord {
    /// Owner.
    pub user_id: String,
    /// Completion time of the last successful cycle.
    pub last_sync_timestamp: Option<Timestamp>,
    /// Set while a cycle holds the sync lock.
    pub sync_in_progress: bool,
    /// Type of the running or last cycle.
    pub current_sync_type: Option<SyncType>,
    /// Pending queue items.
    pub pending_changes: usize,
    /// Failed queue items.
    pub failed_items: usize,
    /// Unresolved conflicts.
    pub conflicts: usize,
    /// When the scheduler plans to evaluate again.
    pub next_scheduled_sync: Option<Timestamp>,
    /// Last cycle failure.
    pub last_error: Option<String>,
    /// Failed cycles in a row.
    pub consecutive_failures: u32,
    /// Reason sync is halted by a fatal error.
    pub halted: Option<String>,
}

impl SyncStateRecord {
    /// Fresh state for `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            last_sync_timestamp: None,
            sync_in_progress: false,
            current_sync_type: None,
            pending_changes: 0,
            failed_items: 0,
            conflicts: 0,
            next_scheduled_sync: None,
            last_error: None,
            consecutive_failures: 0,
            halted: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_type_shapes() {
        let selective = SyncType::Selective(vec![EntityType::Feeding, EntityType::Dog]);
        assert!(selective.includes(EntityType::Dog));
        assert!(!selective.includes(EntityType::Medication));
        assert_eq!(selective.to_string(), "selective(feeding,dog)");

        assert!(!SyncType::Emergency.pulls());
        assert!(SyncType::Emergency.priority_only());
        assert!(SyncType::Initial.pulls_first());
        assert!(!SyncType::Incremental.pulls_everything());
    }
}
