//! Conflict resolution.
//!
//! A conflict is raised when the remote store rejects a queued item because
//! the server version moved past the one the item was based on. The
//! [`ConflictResolver`] compares the queued payload with the server document,
//! picks an outcome from the [`PolicyTable`], persists a [`ConflictRecord`],
//! and puts the queue item and the replica in the matching state.
//!
//! Resolution of one entity is serialized through a per-entity lock so the
//! same conflict is never settled twice.

mod merge;
mod policy;

pub use policy::{FieldRule, PolicyTable};

use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::queue::{ChangeQueue, Rebase};
use crate::store::{EntityRecord, Keyspace, LocalStore, SyncedVersion};
use merge::Tiebreak;
use policy::auto_label;
use pawsync_protocol::{
    ConflictPolicy, ConflictRecord, EntityPayload, EntityRef, EntityType, ManualChoice, Operation,
    QueueItem, RemoteDocument, Resolution, Timestamp,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the caller should do with the queue item after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAction {
    /// The item is `Pending` again, rebased on the server version.
    Push,
    /// The item was discarded and the replica took the server state.
    AcceptServer,
    /// The item is parked until a person resolves the record.
    Parked,
}

/// Result of [`ConflictResolver::resolve`].
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    /// The persisted record.
    pub record: ConflictRecord,
    /// Queue-side effect.
    pub action: ResolutionAction,
}

/// Selects conflict records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictFilter {
    /// Only unresolved records.
    pub unresolved_only: bool,
    /// Only records of this type.
    pub entity_type: Option<EntityType>,
    /// Only records of this entity id.
    pub entity_id: Option<String>,
}

impl ConflictFilter {
    /// Every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Records awaiting a person.
    pub fn unresolved() -> Self {
        Self {
            unresolved_only: true,
            ..Self::default()
        }
    }

    fn matches(&self, record: &ConflictRecord) -> bool {
        (!self.unresolved_only || !record.is_resolved())
            && self.entity_type.map_or(true, |t| t == record.entity_type)
            && self
                .entity_id
                .as_deref()
                .map_or(true, |id| id == record.entity_id)
    }
}

enum Decision {
    Local,
    Server,
    Merged(EntityPayload),
    Manual,
}

/// Settles conflicts between queued changes and server documents.
pub struct ConflictResolver {
    store: Arc<LocalStore>,
    queue: Arc<ChangeQueue>,
    policies: PolicyTable,
    clock: SharedClock,
    locks: Mutex<HashMap<EntityRef, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Creates a resolver over `store` and `queue`.
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<ChangeQueue>,
        policies: PolicyTable,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            queue,
            policies,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The strategy table.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    fn entity_lock(&self, entity: &EntityRef) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolves the conflict between queued `item` and server document `remote`.
    ///
    /// `item` must be `InFlight` or `Pending`.
    pub fn resolve(&self, item: &QueueItem, remote: &RemoteDocument) -> CoreResult<ResolutionOutcome> {
        let entity = item.entity_ref();
        let lock = self.entity_lock(&entity);
        let _guard = lock.lock();

        let now = self.clock.now_millis();
        let server_data = if remote.deleted { None } else { remote.data.clone() };
        let local_data = item.payload.clone();
        let entity_type = item.entity_type;
        let policy = self.policies.policy_for(entity_type);

        let conflicting_fields = match (&local_data, &server_data) {
            (Some(local), Some(server)) => {
                let base = match &item.base_payload {
                    Some(b) => Some(b.to_fields()?),
                    None => None,
                };
                merge::conflicting_fields(base.as_ref(), &local.to_fields()?, &server.to_fields()?)
            }
            _ => Vec::new(),
        };
        let safety_critical = conflicting_fields
            .iter()
            .any(|f| self.policies.is_safety_critical(entity_type, f));

        let lww = if item.local_timestamp > remote.updated_at {
            Decision::Local
        } else {
            Decision::Server
        };
        let decision = if safety_critical || policy == ConflictPolicy::ManualReview {
            Decision::Manual
        } else {
            match policy {
                ConflictPolicy::LocalWins => Decision::Local,
                ConflictPolicy::ServerWins => Decision::Server,
                ConflictPolicy::Merge => self.try_merge(item, remote, &local_data, &server_data).unwrap_or(lww),
                _ => lww,
            }
        };

        let mut record = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            queue_item_id: Some(item.id.clone()),
            entity_type,
            entity_id: item.entity_id.clone(),
            local_timestamp: item.local_timestamp,
            server_timestamp: remote.updated_at,
            base_version: item.base_version,
            server_version: remote.version,
            local_data: local_data.clone(),
            server_data: server_data.clone(),
            merged_data: None,
            conflicting_fields,
            resolution: Resolution::Pending,
            resolved_at: None,
            resolved_by: None,
            created_at: now,
        };

        let action = match decision {
            Decision::Local => {
                self.push(&item.id, local_data, remote, server_data, false)?;
                record.resolution = Resolution::LocalWins;
                ResolutionAction::Push
            }
            Decision::Merged(merged) => {
                self.write_replica(&entity, Some(merged.clone()), remote, now)?;
                self.push(&item.id, Some(merged.clone()), remote, server_data, false)?;
                record.resolution = Resolution::Merge;
                record.merged_data = Some(merged);
                ResolutionAction::Push
            }
            Decision::Server => {
                self.queue.discard(&item.id)?;
                self.accept_server(&entity, remote, now)?;
                record.resolution = Resolution::ServerWins;
                ResolutionAction::AcceptServer
            }
            Decision::Manual => {
                self.queue.park(&item.id, &record.id)?;
                ResolutionAction::Parked
            }
        };

        if action != ResolutionAction::Parked {
            record.resolved_at = Some(now);
            record.resolved_by = Some(auto_label(policy));
        }
        self.store.put_typed(Keyspace::Conflicts, &record.id, &record)?;

        info!(
            conflict = %record.id,
            entity = %entity,
            resolution = ?record.resolution,
            fields = ?record.conflicting_fields,
            "conflict recorded"
        );
        Ok(ResolutionOutcome { record, action })
    }

    fn try_merge(
        &self,
        item: &QueueItem,
        remote: &RemoteDocument,
        local: &Option<EntityPayload>,
        server: &Option<EntityPayload>,
    ) -> Option<Decision> {
        let (Some(local), Some(server)) = (local, server) else {
            return None;
        };
        if !PolicyTable::is_mergeable(item.entity_type) {
            return None;
        }
        let base = match &item.base_payload {
            Some(b) => Some(b.to_fields().ok()?),
            None => None,
        };
        let tiebreak = if item.local_timestamp > remote.updated_at {
            Tiebreak::Local
        } else {
            Tiebreak::Server
        };
        let merged = merge::merge_fields(
            base.as_ref(),
            &local.to_fields().ok()?,
            &server.to_fields().ok()?,
            tiebreak,
            |field| self.policies.field_rule(item.entity_type, field),
        );
        match EntityPayload::from_fields(item.entity_type, merged) {
            Ok(payload) => Some(Decision::Merged(payload)),
            Err(e) => {
                warn!(entity = %item.entity_ref(), error = %e, "merge produced an invalid payload");
                None
            }
        }
    }

    /// Sends `payload` again on top of the server version.
    fn push(
        &self,
        item_id: &str,
        payload: Option<EntityPayload>,
        remote: &RemoteDocument,
        server_data: Option<EntityPayload>,
        parked: bool,
    ) -> CoreResult<QueueItem> {
        let operation = match (&payload, remote.deleted) {
            (None, _) => Operation::Delete,
            (Some(_), true) => Operation::Create,
            (Some(_), false) => Operation::Update,
        };
        let rebase = Rebase {
            operation,
            payload,
            base_version: Some(remote.version),
            base_payload: server_data,
        };
        if parked {
            self.queue.unpark(item_id, rebase)
        } else {
            self.queue.requeue_resolved(item_id, rebase)
        }
    }

    /// Takes the server state into the replica unless newer local changes
    /// are still queued. In that case only the synced version moves and the
    /// queued items are rebased onto the server version.
    fn accept_server(&self, entity: &EntityRef, remote: &RemoteDocument, now: Timestamp) -> CoreResult<()> {
        let data = if remote.deleted { None } else { remote.data.clone() };
        if self.queue.has_items_for(entity) {
            if let Some(mut record) = self.store.get_entity(entity)? {
                record.synced = Some(synced_from(remote));
                self.store.put_entity(&record)?;
            }
            self.queue.rebase_entity(entity, remote.version, data)?;
            return Ok(());
        }
        self.write_replica(entity, data, remote, now)
    }

    fn write_replica(
        &self,
        entity: &EntityRef,
        payload: Option<EntityPayload>,
        remote: &RemoteDocument,
        now: Timestamp,
    ) -> CoreResult<()> {
        let Some(payload) = payload else {
            self.store.delete_entity(entity)?;
            return Ok(());
        };
        let mut record = match self.store.get_entity(entity)? {
            Some(mut record) => {
                record.set_payload(payload, now)?;
                record
            }
            None => EntityRecord::new(entity.entity_id.as_str(), payload, now)?,
        };
        record.synced = Some(synced_from(remote));
        self.store.put_entity(&record)?;
        Ok(())
    }

    /// Settles a record awaiting manual review.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyResolved`] if the record is terminal.
    pub fn resolve_manual(
        &self,
        conflict_id: &str,
        choice: ManualChoice,
        resolved_by: &str,
    ) -> CoreResult<ConflictRecord> {
        let entity = self.load(conflict_id)?.entity_ref();
        let lock = self.entity_lock(&entity);
        let _guard = lock.lock();

        let mut record = self.load(conflict_id)?;
        if record.is_resolved() {
            return Err(CoreError::AlreadyResolved {
                id: conflict_id.to_string(),
            });
        }
        let now = self.clock.now_millis();
        let remote = RemoteDocument {
            id: record.entity_id.clone(),
            version: record.server_version,
            updated_at: record.server_timestamp,
            deleted: record.server_data.is_none(),
            data: record.server_data.clone(),
        };
        let item = record
            .queue_item_id
            .as_deref()
            .and_then(|id| self.queue.get(id));

        match choice {
            ManualChoice::KeepLocal => {
                self.push_manual(item.as_ref(), &entity, record.local_data.clone(), &remote)?;
                record.resolution = Resolution::LocalWins;
            }
            ManualChoice::KeepServer => {
                if let Some(item) = &item {
                    self.queue.discard(&item.id)?;
                }
                self.accept_server(&entity, &remote, now)?;
                record.resolution = Resolution::ServerWins;
            }
            ManualChoice::Custom(payload) => {
                payload.ensure_type(record.entity_type)?;
                self.write_replica(&entity, Some(payload.clone()), &remote, now)?;
                self.push_manual(item.as_ref(), &entity, Some(payload.clone()), &remote)?;
                record.resolution = Resolution::ManualReview;
                record.merged_data = Some(payload);
            }
        }

        record.resolved_at = Some(now);
        record.resolved_by = Some(resolved_by.to_string());
        self.store.put_typed(Keyspace::Conflicts, &record.id, &record)?;
        info!(
            conflict = %record.id,
            entity = %entity,
            resolution = ?record.resolution,
            by = resolved_by,
            "conflict resolved manually"
        );
        Ok(record)
    }

    fn push_manual(
        &self,
        item: Option<&QueueItem>,
        entity: &EntityRef,
        payload: Option<EntityPayload>,
        remote: &RemoteDocument,
    ) -> CoreResult<()> {
        match item {
            Some(item) => {
                let parked = item.is_parked();
                self.push(&item.id, payload, remote, remote.data.clone(), parked)?;
            }
            None => {
                warn!(entity = %entity, "parked item is gone; enqueueing the chosen payload");
                let mutation = match payload {
                    Some(p) => pawsync_protocol::Mutation::update(entity.entity_id.as_str(), p),
                    None => pawsync_protocol::Mutation::delete(entity.entity_type, entity.entity_id.as_str()),
                };
                self.queue.enqueue(mutation)?;
            }
        }
        Ok(())
    }

    fn load(&self, conflict_id: &str) -> CoreResult<ConflictRecord> {
        self.get_conflict(conflict_id)?
            .ok_or_else(|| CoreError::ConflictNotFound {
                id: conflict_id.to_string(),
            })
    }

    /// One record.
    pub fn get_conflict(&self, conflict_id: &str) -> CoreResult<Option<ConflictRecord>> {
        self.store.get_typed(Keyspace::Conflicts, conflict_id)
    }

    /// Records matching `filter`, oldest first.
    pub fn list_conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self
            .store
            .scan_typed::<ConflictRecord>(Keyspace::Conflicts)
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Number of records awaiting a person.
    pub fn unresolved_count(&self) -> usize {
        self.list_conflicts(&ConflictFilter::unresolved()).len()
    }

    /// Deletes resolved records settled before `before`.
    pub fn prune_resolved(&self, before: Timestamp) -> CoreResult<usize> {
        let mut pruned = 0;
        for record in self.list_conflicts(&ConflictFilter::all()) {
            if record.resolved_at.is_some_and(|t| t < before)
                && self.store.delete(Keyspace::Conflicts, &record.id)?
            {
                pruned += 1;
            }
        }
        self.locks.lock().retain(|_, l| Arc::strong_count(l) > 1);
        if pruned > 0 {
            debug!(pruned, "pruned resolved conflicts");
        }
        Ok(pruned)
    }
}

fn synced_from(remote: &RemoteDocument) -> SyncedVersion {
    SyncedVersion {
        version: remote.version,
        server_timestamp: remote.updated_at,
        payload: if remote.deleted { None } else { remote.data.clone() },
    }
}
