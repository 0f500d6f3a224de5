//! Integrity checks over the local store.
//!
//! | Check    | Scope                                              | Mutates |
//! |----------|----------------------------------------------------|---------|
//! | `Quick`  | entities and queue items written since last quick  | no      |
//! | `Full`   | every record, plus log replay errors               | no      |
//! | `Deep`   | `Full` plus payload checksums                      | no      |
//! | `Repair` | `Deep`, then fixes what it can                     | yes     |
//!
//! Every run is appended to the integrity log. Orphaned references are only
//! reported: the missing entity may still arrive from the remote store.

use crate::clock::SharedClock;
use crate::error::CoreResult;
use crate::queue::{ChangeQueue, Rebase};
use crate::store::{normalize_entity_key, EntityRecord, Keyspace, LocalStore, META_QUICK_WATERMARK};
use pawsync_protocol::{
    decode, payload_checksum, CheckType, ConflictRecord, EntityRef, IntegrityCheckResult,
    IntegrityIssue, IssueKind, NetworkStateSample, Operation, QueueItem, SyncStateRecord,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of results kept in the integrity log.
pub const DEFAULT_RESULTS_KEPT: usize = 20;

/// Runs integrity checks and keeps their history.
pub struct IntegrityChecker {
    store: Arc<LocalStore>,
    queue: Arc<ChangeQueue>,
    clock: SharedClock,
    results_kept: usize,
}

impl std::fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityChecker")
            .field("results_kept", &self.results_kept)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Scan {
    items_checked: usize,
    issues: Vec<IntegrityIssue>,
}

impl Scan {
    fn report(&mut self, kind: IssueKind, entity: Option<EntityRef>, key: &str, detail: String) {
        debug!(?kind, key, "integrity issue: {detail}");
        self.issues.push(IntegrityIssue {
            kind,
            entity,
            key: key.to_string(),
            detail,
            fixed: false,
        });
    }
}

impl IntegrityChecker {
    /// Creates a checker.
    pub fn new(store: Arc<LocalStore>, queue: Arc<ChangeQueue>, clock: SharedClock) -> Self {
        Self {
            store,
            queue,
            clock,
            results_kept: DEFAULT_RESULTS_KEPT,
        }
    }

    /// Sets how many results the log keeps.
    #[must_use]
    pub fn with_results_kept(mut self, kept: usize) -> Self {
        self.results_kept = kept.max(1);
        self
    }

    /// Runs a check and appends its result to the log.
    pub fn run_check(&self, check_type: CheckType) -> CoreResult<IntegrityCheckResult> {
        let started_at = self.clock.now_millis();
        let watermark = self.store.last_seq();

        let mut scan = Scan::default();
        match check_type {
            CheckType::Quick => self.scan_quick(&mut scan)?,
            CheckType::Full => self.scan_full(&mut scan, false)?,
            CheckType::Deep | CheckType::Repair => self.scan_full(&mut scan, true)?,
        }
        if check_type == CheckType::Repair {
            self.repair(&mut scan.issues)?;
        }

        let corrupted_items: Vec<EntityRef> = scan
            .issues
            .iter()
            .filter_map(|i| i.entity.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let result = IntegrityCheckResult {
            id: Uuid::new_v4().to_string(),
            check_type,
            items_checked: scan.items_checked,
            issues_found: scan.issues.len(),
            issues_fixed: scan.issues.iter().filter(|i| i.fixed).count(),
            corrupted_items,
            recommendations: recommendations(check_type, &scan.issues),
            issues: scan.issues,
            started_at,
            finished_at: self.clock.now_millis(),
        };

        if check_type == CheckType::Quick {
            self.store.put_typed(Keyspace::Meta, META_QUICK_WATERMARK, &watermark)?;
        }
        let key = format!("{started_at:020}-{:020}", self.store.last_seq() + 1);
        self.store.put_typed(Keyspace::IntegrityLog, &key, &result)?;
        self.prune_log()?;

        if result.is_clean() {
            info!(check = %check_type, checked = result.items_checked, "integrity check clean");
        } else {
            warn!(
                check = %check_type,
                checked = result.items_checked,
                found = result.issues_found,
                fixed = result.issues_fixed,
                "integrity check found issues"
            );
        }
        Ok(result)
    }

    /// Past results, oldest first.
    pub fn history(&self) -> Vec<IntegrityCheckResult> {
        self.store
            .scan_typed(Keyspace::IntegrityLog)
            .into_iter()
            .map(|(_, r)| r)
            .collect()
    }

    /// The most recent result.
    pub fn last_result(&self) -> Option<IntegrityCheckResult> {
        self.history().pop()
    }

    fn prune_log(&self) -> CoreResult<()> {
        let keys: Vec<String> = self
            .store
            .scan(Keyspace::IntegrityLog)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let excess = keys.len().saturating_sub(self.results_kept);
        for key in keys.into_iter().take(excess) {
            self.store.delete(Keyspace::IntegrityLog, &key)?;
        }
        Ok(())
    }

    fn scan_quick(&self, scan: &mut Scan) -> CoreResult<()> {
        let since: u64 = self
            .store
            .get_typed(Keyspace::Meta, META_QUICK_WATERMARK)?
            .unwrap_or(0);

        for (keyspace, key, _) in self.store.touched_since(since) {
            match keyspace {
                Keyspace::Entities => {
                    scan.items_checked += 1;
                    if let Some(record) = self.check_entity_record(scan, &key) {
                        self.check_references(scan, &key, &record);
                    }
                }
                Keyspace::Queue => {
                    scan.items_checked += 1;
                    if let Some(item) = self.decode_or_report::<QueueItem>(scan, keyspace, &key) {
                        self.check_queue_item(scan, &key, &item);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn scan_full(&self, scan: &mut Scan, verify_checksums: bool) -> CoreResult<()> {
        for error in self.store.replay_errors() {
            scan.report(
                IssueKind::MalformedRecord,
                None,
                &format!("log@{}", error.offset),
                format!("{} ({} bytes discarded)", error.message, error.discarded_bytes),
            );
        }

        let mut canonical: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, _) in self.store.scan(Keyspace::Entities) {
            scan.items_checked += 1;
            let Some(record) = self.check_entity_record(scan, &key) else {
                continue;
            };
            canonical
                .entry(record.entity_ref().storage_key())
                .or_default()
                .push(key.clone());
            self.check_references(scan, &key, &record);
            if verify_checksums && payload_checksum(&record.payload)? != record.checksum {
                scan.report(
                    IssueKind::ChecksumMismatch,
                    Some(record.entity_ref()),
                    &key,
                    "stored checksum does not match payload".into(),
                );
            }
        }
        for (normal, keys) in canonical {
            if keys.len() > 1 {
                let entity = self
                    .store
                    .get_typed::<EntityRecord>(Keyspace::Entities, &keys[0])
                    .ok()
                    .flatten()
                    .map(|r| r.entity_ref());
                scan.report(
                    IssueKind::DuplicateKey,
                    entity,
                    &normal,
                    format!("{} records: {}", keys.len(), keys.join(", ")),
                );
            } else if keys[0] != normal {
                scan.report(
                    IssueKind::MalformedRecord,
                    None,
                    &format!("{}/{}", Keyspace::Entities.name(), keys[0]),
                    format!("non-canonical key, expected {normal}"),
                );
            }
        }

        for (key, _) in self.store.scan(Keyspace::Queue) {
            scan.items_checked += 1;
            if let Some(item) = self.decode_or_report::<QueueItem>(scan, Keyspace::Queue, &key) {
                self.check_queue_item(scan, &key, &item);
            }
        }

        for (key, _) in self.store.scan(Keyspace::Conflicts) {
            scan.items_checked += 1;
            self.decode_or_report::<ConflictRecord>(scan, Keyspace::Conflicts, &key);
        }
        for (key, _) in self.store.scan(Keyspace::SyncState) {
            scan.items_checked += 1;
            self.decode_or_report::<SyncStateRecord>(scan, Keyspace::SyncState, &key);
        }
        for (key, _) in self.store.scan(Keyspace::NetworkSamples) {
            scan.items_checked += 1;
            self.decode_or_report::<NetworkStateSample>(scan, Keyspace::NetworkSamples, &key);
        }
        for (key, _) in self.store.scan(Keyspace::IntegrityLog) {
            scan.items_checked += 1;
            self.decode_or_report::<IntegrityCheckResult>(scan, Keyspace::IntegrityLog, &key);
        }
        Ok(())
    }

    fn decode_or_report<T: serde::de::DeserializeOwned>(
        &self,
        scan: &mut Scan,
        keyspace: Keyspace,
        key: &str,
    ) -> Option<T> {
        let bytes = self.store.get(keyspace, key)?;
        match decode::<T>(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                scan.report(
                    IssueKind::MalformedRecord,
                    None,
                    &format!("{}/{key}", keyspace.name()),
                    e.to_string(),
                );
                None
            }
        }
    }

    /// Decodes an entity record and checks that it matches its key.
    fn check_entity_record(&self, scan: &mut Scan, key: &str) -> Option<EntityRecord> {
        let record = self.decode_or_report::<EntityRecord>(scan, Keyspace::Entities, key)?;
        if filed_under(key, &record) && record.payload.entity_type() == record.entity_type {
            return Some(record);
        }
        scan.report(
            IssueKind::MalformedRecord,
            Some(record.entity_ref()),
            &format!("{}/{key}", Keyspace::Entities.name()),
            format!("record for {} stored under {key}", record.entity_ref()),
        );
        None
    }

    fn check_references(&self, scan: &mut Scan, key: &str, record: &EntityRecord) {
        for target in record.payload.references() {
            if !self.store.entity_exists(&target) {
                scan.report(
                    IssueKind::OrphanedReference,
                    Some(record.entity_ref()),
                    key,
                    format!("{} points at missing {target}", record.entity_ref()),
                );
            }
        }
    }

    fn check_queue_item(&self, scan: &mut Scan, key: &str, item: &QueueItem) {
        let entity = item.entity_ref();
        if item.operation != Operation::Delete && !self.store.entity_exists(&entity) {
            let deleted_later = self
                .queue
                .items_for(&entity)
                .iter()
                .any(|i| i.operation == Operation::Delete && i.order_key() > item.order_key());
            if !deleted_later {
                scan.report(
                    IssueKind::OrphanedQueueItem,
                    Some(entity.clone()),
                    key,
                    format!("{:?} for missing {entity}", item.operation),
                );
            }
        }
        if let Some(conflict_id) = &item.conflict_id {
            if !self.store.contains(Keyspace::Conflicts, conflict_id) {
                scan.report(
                    IssueKind::DanglingConflict,
                    Some(entity),
                    key,
                    format!("parked behind missing conflict {conflict_id}"),
                );
            }
        }
    }

    fn repair(&self, issues: &mut [IntegrityIssue]) -> CoreResult<()> {
        let mut replay_cleared = false;
        let mut deleted: HashSet<String> = HashSet::new();

        for issue in issues.iter_mut() {
            issue.fixed = match issue.kind {
                IssueKind::OrphanedQueueItem => self.queue.discard(&issue.key)?.is_some(),
                IssueKind::DanglingConflict => match self.queue.get(&issue.key) {
                    Some(item) => {
                        self.queue.unpark(
                            &item.id,
                            Rebase {
                                operation: item.operation,
                                payload: item.payload.clone(),
                                base_version: item.base_version,
                                base_payload: item.base_payload.clone(),
                            },
                        )?;
                        true
                    }
                    None => false,
                },
                IssueKind::ChecksumMismatch => {
                    match self.store.get_typed::<EntityRecord>(Keyspace::Entities, &issue.key)? {
                        Some(mut record) => {
                            record.checksum = payload_checksum(&record.payload)?;
                            self.store.put_typed(Keyspace::Entities, &issue.key, &record)?;
                            true
                        }
                        None => false,
                    }
                }
                IssueKind::DuplicateKey => self.dedupe(&issue.key)?,
                IssueKind::MalformedRecord => {
                    if issue.key.starts_with("log@") {
                        if !replay_cleared {
                            self.store.clear_replay_errors();
                            replay_cleared = true;
                        }
                        true
                    } else {
                        self.repair_malformed(&issue.key, &mut deleted)?
                    }
                }
                IssueKind::OrphanedReference => false,
            };
            if issue.fixed {
                warn!(kind = ?issue.kind, key = %issue.key, "repaired");
            }
        }
        Ok(())
    }

    /// Keeps the most recently updated record under the canonical key.
    fn dedupe(&self, canonical: &str) -> CoreResult<bool> {
        let mut records: Vec<(String, EntityRecord)> = Vec::new();
        for (key, bytes) in self.store.scan(Keyspace::Entities) {
            if let Ok(record) = decode::<EntityRecord>(&bytes) {
                if record.entity_ref().storage_key() == canonical && filed_under(&key, &record) {
                    records.push((key, record));
                }
            }
        }
        let Some(latest) = records
            .iter()
            .max_by_key(|(_, r)| r.updated_at)
            .map(|(_, r)| r.clone())
        else {
            return Ok(false);
        };
        for (key, _) in &records {
            if key != canonical {
                self.store.delete(Keyspace::Entities, key)?;
            }
        }
        self.store.put_entity(&latest)?;
        Ok(true)
    }

    /// Moves a record spelled under a legacy key to its canonical key;
    /// deletes anything else.
    fn repair_malformed(&self, key: &str, deleted: &mut HashSet<String>) -> CoreResult<bool> {
        let Some((ks_name, record_key)) = key.split_once('/') else {
            return Ok(false);
        };
        let Some(keyspace) = Keyspace::ALL.into_iter().find(|k| k.name() == ks_name) else {
            return Ok(false);
        };
        if !deleted.insert(key.to_string()) {
            return Ok(true);
        }
        if keyspace == Keyspace::Entities {
            if let Ok(Some(record)) = self.store.get_typed::<EntityRecord>(keyspace, record_key) {
                let canonical = record.entity_ref().storage_key();
                if normalize_entity_key(record_key).as_deref() == Some(canonical.as_str())
                    && !self.store.contains(keyspace, &canonical)
                {
                    self.store.put_entity(&record)?;
                    self.store.delete(keyspace, record_key)?;
                    return Ok(true);
                }
            }
        }
        Ok(self.store.delete(keyspace, record_key)?)
    }
}

/// Whether `record` belongs under `key`: its own canonical key, or a legacy
/// spelling of it. Ids are never trimmed here, so a record stored exactly
/// under its own key is never treated as misfiled.
fn filed_under(key: &str, record: &EntityRecord) -> bool {
    let expected = record.entity_ref().storage_key();
    key == expected || normalize_entity_key(key).is_some_and(|normal| normal == expected)
}

fn recommendations(check_type: CheckType, issues: &[IntegrityIssue]) -> Vec<String> {
    let kinds: HashSet<IssueKind> = issues.iter().map(|i| i.kind).collect();
    let unfixed = issues.iter().any(|i| !i.fixed);
    let mut out = Vec::new();

    if kinds.contains(&IssueKind::OrphanedReference) {
        out.push("restore the referenced entities or delete the records pointing at them".to_string());
    }
    if issues.iter().any(|i| i.key.starts_with("log@")) {
        out.push("the log had a corrupt tail; recent local writes may need to be re-entered".to_string());
    }
    if check_type != CheckType::Repair && unfixed && kinds.iter().any(|k| *k != IssueKind::OrphanedReference) {
        out.push("run a repair check".to_string());
    }
    if check_type == CheckType::Quick && !issues.is_empty() {
        out.push("run a full check to scan the whole store".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{QueueConfig, StoreConfig};
    use crate::error::CoreError;
    use pawsync_protocol::{encode, Dog, EntityPayload, EntityType, Feeding, Mutation, ProtocolError};
    use pawsync_storage::InMemoryBackend;

    fn dog(name: &str) -> EntityPayload {
        EntityPayload::Dog(Dog {
            name: name.into(),
            breed: None,
            birth_date: None,
            weight_kg: None,
            allergies: vec![],
            tags: vec![],
        })
    }

    fn feeding(dog_id: &str) -> EntityPayload {
        EntityPayload::Feeding(Feeding {
            dog_id: dog_id.into(),
            product_id: None,
            amount_grams: 100,
            fed_at: 1,
            notes: None,
        })
    }

    fn checker_over(store: Arc<LocalStore>) -> (Arc<ChangeQueue>, IntegrityChecker) {
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = Arc::new(ChangeQueue::open(store.clone(), QueueConfig::default(), clock.clone()).unwrap());
        let checker = IntegrityChecker::new(store, queue.clone(), clock);
        (queue, checker)
    }

    fn setup() -> (Arc<LocalStore>, Arc<ChangeQueue>, IntegrityChecker) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let (queue, checker) = checker_over(store.clone());
        (store, queue, checker)
    }

    #[test]
    fn quick_check_is_idempotent() {
        let (_, queue, checker) = setup();
        queue.enqueue(Mutation::create("rex", dog("Rex"))).unwrap();
        queue.enqueue(Mutation::create("1", feeding("ghost"))).unwrap();

        let first = checker.run_check(CheckType::Quick).unwrap();
        assert_eq!(first.issues_found, 1);
        assert_eq!(first.issues[0].kind, IssueKind::OrphanedReference);

        let second = checker.run_check(CheckType::Quick).unwrap();
        assert_eq!(second.issues_found, 0);
        assert_eq!(second.items_checked, 0);
        assert_eq!(checker.history().len(), 2);
    }

    #[test]
    fn full_check_does_not_mutate() {
        let (store, _, checker) = setup();
        let record = EntityRecord::new("1", feeding("ghost"), 5).unwrap();
        store.put_entity(&record).unwrap();

        let before = store.scan(Keyspace::Entities);
        let result = checker.run_check(CheckType::Full).unwrap();
        assert_eq!(result.issues_found, 1);
        assert_eq!(result.issues_fixed, 0);
        assert_eq!(store.scan(Keyspace::Entities), before);
        assert!(!result.recommendations.is_empty());
    }

    #[test]
    fn repair_drops_orphaned_queue_items() {
        let (store, queue, checker) = setup();
        let item = queue.enqueue(Mutation::create("rex", dog("Rex"))).unwrap();
        store.delete_entity(&item.entity_ref()).unwrap();

        let full = checker.run_check(CheckType::Full).unwrap();
        assert_eq!(full.issues[0].kind, IssueKind::OrphanedQueueItem);

        let repair = checker.run_check(CheckType::Repair).unwrap();
        assert_eq!(repair.issues_fixed, 1);
        assert!(queue.get(&item.id).is_none());
        assert!(checker.run_check(CheckType::Full).unwrap().is_clean());
    }

    #[test]
    fn deep_check_finds_checksum_mismatch() {
        let (store, _, checker) = setup();
        let mut record = EntityRecord::new("rex", dog("Rex"), 5).unwrap();
        record.checksum = [0u8; 32];
        store.put_entity(&record).unwrap();

        assert!(checker.run_check(CheckType::Full).unwrap().is_clean());
        let deep = checker.run_check(CheckType::Deep).unwrap();
        assert_eq!(deep.issues[0].kind, IssueKind::ChecksumMismatch);
        assert_eq!(deep.corrupted_items, vec![EntityRef::new(EntityType::Dog, "rex")]);

        checker.run_check(CheckType::Repair).unwrap();
        assert!(store
            .get_entity(&record.entity_ref())
            .unwrap()
            .unwrap()
            .checksum_matches()
            .unwrap());
    }

    #[test]
    fn duplicates_keep_most_recent() {
        let (store, _, checker) = setup();
        let old = EntityRecord::new("rex", dog("Old"), 5).unwrap();
        let new = EntityRecord::new("rex", dog("New"), 9).unwrap();
        store.put_entity(&old).unwrap();
        store
            .put(Keyspace::Entities, "Dogs/rex", encode(&new).unwrap())
            .unwrap();

        let full = checker.run_check(CheckType::Full).unwrap();
        assert_eq!(full.issues.len(), 1);
        assert_eq!(full.issues[0].kind, IssueKind::DuplicateKey);

        checker.run_check(CheckType::Repair).unwrap();
        assert_eq!(store.count(Keyspace::Entities), 1);
        let kept = store.get_entity(&old.entity_ref()).unwrap().unwrap();
        assert_eq!(kept.payload, dog("New"));
    }

    #[test]
    fn malformed_records_are_deleted_on_repair() {
        let (store, _, checker) = setup();
        store.put(Keyspace::Conflicts, "c1", vec![0xff, 0x00]).unwrap();

        let full = checker.run_check(CheckType::Full).unwrap();
        assert_eq!(full.issues[0].kind, IssueKind::MalformedRecord);
        checker.run_check(CheckType::Repair).unwrap();
        assert!(!store.contains(Keyspace::Conflicts, "c1"));
    }

    #[test]
    fn dangling_conflict_unparks_item() {
        let (_, queue, checker) = setup();
        let item = queue.enqueue(Mutation::create("rex", dog("Rex"))).unwrap();
        queue.dequeue_batch(1, u64::MAX).unwrap();
        queue.park(&item.id, "missing").unwrap();

        let repair = checker.run_check(CheckType::Repair).unwrap();
        assert_eq!(repair.issues[0].kind, IssueKind::DanglingConflict);
        assert!(repair.issues[0].fixed);
        assert!(!queue.get(&item.id).unwrap().is_parked());
    }

    #[test]
    fn replay_errors_are_reported() {
        let backend = InMemoryBackend::new();
        let first_len;
        {
            let store = LocalStore::open(Box::new(backend.clone()), StoreConfig::default()).unwrap();
            store.put(Keyspace::Meta, "a", vec![1; 8]).unwrap();
            first_len = backend.data().len();
            store.put(Keyspace::Meta, "b", vec![2; 8]).unwrap();
        }
        backend.corrupt_byte(first_len + 18);

        let store = Arc::new(LocalStore::open(Box::new(backend), StoreConfig::default()).unwrap());
        let (_, checker) = checker_over(store.clone());
        let full = checker.run_check(CheckType::Full).unwrap();
        assert!(full.issues.iter().any(|i| i.key.starts_with("log@")));

        checker.run_check(CheckType::Repair).unwrap();
        assert!(store.replay_errors().is_empty());
    }

    #[test]
    fn legacy_key_moves_to_canonical() {
        let (store, _, checker) = setup();
        let record = EntityRecord::new("rex", dog("Rex"), 5).unwrap();
        store
            .put(Keyspace::Entities, "Dogs/ rex", encode(&record).unwrap())
            .unwrap();

        let repair = checker.run_check(CheckType::Repair).unwrap();
        assert_eq!(repair.issues_fixed, 1);
        assert!(store.entity_exists(&record.entity_ref()));
        assert_eq!(store.count(Keyspace::Entities), 1);
    }

    #[test]
    fn padded_entity_ids_are_refused_at_enqueue() {
        let (store, queue, checker) = setup();
        assert!(matches!(
            queue.enqueue(Mutation::create("rex ", dog("Rex"))),
            Err(CoreError::Protocol(ProtocolError::InvalidEntityId(_)))
        ));
        assert_eq!(store.count(Keyspace::Entities), 0);
        assert!(queue.items().is_empty());
        assert!(checker.run_check(CheckType::Full).unwrap().is_clean());
    }

    #[test]
    fn record_under_its_own_padded_key_survives_repair() {
        let (store, _, checker) = setup();
        let record = EntityRecord::new("rex ", dog("Rex"), 5).unwrap();
        store.put_entity(&record).unwrap();
        store.put_entity(&EntityRecord::new("rex", dog("Other Rex"), 6).unwrap()).unwrap();

        assert!(checker.run_check(CheckType::Full).unwrap().is_clean());
        let repair = checker.run_check(CheckType::Repair).unwrap();
        assert_eq!(repair.issues_fixed, 0);
        assert_eq!(store.count(Keyspace::Entities), 2);
        let kept = store.get_entity(&record.entity_ref()).unwrap().unwrap();
        assert_eq!(kept.payload, dog("Rex"));
    }

    #[test]
    fn log_is_bounded() {
        let (_, _, checker) = setup();
        let checker = checker.with_results_kept(3);
        for _ in 0..5 {
            checker.run_check(CheckType::Quick).unwrap();
        }
        assert_eq!(checker.history().len(), 3);
    }
}
