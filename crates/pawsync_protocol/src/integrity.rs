//! Integrity check reports.

use crate::entity::EntityRef;
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Depth of an integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckType {
    /// Referential checks over records written since the previous quick run.
    Quick,
    /// Referential and structural checks over the whole store.
    Full,
    /// `Full` plus payload checksum verification.
    Deep,
    /// `Deep`, then fix what can be fixed.
    Repair,
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckType::Quick => "quick",
            CheckType::Full => "full",
            CheckType::Deep => "deep",
            CheckType::Repair => "repair",
        };
        f.write_str(s)
    }
}

/// Category of a problem found by a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    /// A queued create/update whose entity no longer exists locally.
    OrphanedQueueItem,
    /// An entity pointing at a missing entity, e.g. a feeding without its dog.
    OrphanedReference,
    /// Two entity records under keys that normalize to the same entity.
    DuplicateKey,
    /// Stored checksum does not match the payload.
    ChecksumMismatch,
    /// A record that does not decode, or a torn log frame.
    MalformedRecord,
    /// A parked queue item whose conflict record is gone.
    DanglingConflict,
}

/// One problem found by a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    /// Category.
    pub kind: IssueKind,
    /// Affected entity, when there is one.
    pub entity: Option<EntityRef>,
    /// Store key of the offending record.
    pub key: String,
    /// Human-readable detail.
    pub detail: String,
    /// Whether a repair run fixed it.
    pub fixed: bool,
}

/// Output of a check run. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    /// Unique id.
    pub id: String,
    /// Depth of the run.
    pub check_type: CheckType,
    /// Records examined.
    pub items_checked: usize,
    /// Problems found.
    pub issues_found: usize,
    /// Problems fixed (repair only).
    pub issues_fixed: usize,
    /// Entities affected by any issue.
    pub corrupted_items: Vec<EntityRef>,
    /// Suggested follow-ups.
    pub recommendations: Vec<String>,
    /// Detailed findings.
    pub issues: Vec<IntegrityIssue>,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run finished.
    pub finished_at: Timestamp,
}

impl IntegrityCheckResult {
    /// Whether the run found nothing.
    pub fn is_clean(&self) -> bool {
        self.issues_found == 0
    }
}
