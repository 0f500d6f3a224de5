//! The change queue: a durable, ordered outbox of local mutations.
//!
//! Items are persisted in the [`Keyspace::Queue`] keyspace and cached in
//! memory. Per entity, items are delivered in `(local_timestamp, seq)` order:
//! an item is only eligible once every earlier item for the same entity has
//! been acknowledged or is handed out in the same batch ahead of it.
//! Cross-entity order is unspecified; priority items go first.
//!
//! Enqueueing also applies the mutation to the local replica, so the host
//! reads its own writes while offline.

use crate::clock::SharedClock;
use crate::config::QueueConfig;
use crate::error::{CoreError, CoreResult};
use crate::store::{EntityRecord, Keyspace, LocalStore};
use pawsync_protocol::{
    encode, EntityPayload, EntityRef, EntityType, Mutation, Operation, QueueItem, QueueItemStatus,
    QueueStatus, SyncType, Timestamp,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Restricts which items a batch may contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchFilter {
    /// Only priority items.
    pub priority_only: bool,
    /// Only these entity types.
    pub entity_types: Option<Vec<EntityType>>,
}

impl BatchFilter {
    /// Admits everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// The filter a cycle of `sync_type` drains with.
    pub fn for_sync_type(sync_type: &SyncType) -> Self {
        Self {
            priority_only: sync_type.priority_only(),
            entity_types: match sync_type {
                SyncType::Selective(types) => Some(types.clone()),
                _ => None,
            },
        }
    }

    fn admits(&self, item: &QueueItem) -> bool {
        (!self.priority_only || item.priority)
            && self
                .entity_types
                .as_ref()
                .map_or(true, |types| types.contains(&item.entity_type))
    }
}

/// New content for an item that goes back to `Pending` after a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Rebase {
    /// Operation to send.
    pub operation: Operation,
    /// Payload to send.
    pub payload: Option<EntityPayload>,
    /// Server version to write against.
    pub base_version: Option<u64>,
    /// Server payload at that version.
    pub base_payload: Option<EntityPayload>,
}

#[derive(Debug, Clone, Copy)]
struct ThroughputHint {
    kbps: u32,
    latency_ms: u32,
}

struct QueueState {
    items: HashMap<String, QueueItem>,
    next_seq: u64,
    status: QueueStatus,
    throughput: Option<ThroughputHint>,
}

/// Durable outbox of pending mutations.
pub struct ChangeQueue {
    store: Arc<LocalStore>,
    config: QueueConfig,
    clock: SharedClock,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for ChangeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeQueue")
            .field("status", &self.state.lock().status)
            .finish()
    }
}

impl ChangeQueue {
    /// Loads the queue from `store`.
    ///
    /// Items left `InFlight` by an interrupted drain return to `Pending`.
    pub fn open(store: Arc<LocalStore>, config: QueueConfig, clock: SharedClock) -> CoreResult<Self> {
        let mut items = HashMap::new();
        let mut next_seq = 1;
        let mut recovered = 0;

        for (key, mut item) in store.scan_typed::<QueueItem>(Keyspace::Queue) {
            if item.status == QueueItemStatus::InFlight {
                item.status = QueueItemStatus::Pending;
                store.put_typed(Keyspace::Queue, &key, &item)?;
                recovered += 1;
            }
            next_seq = next_seq.max(item.seq + 1);
            items.insert(item.id.clone(), item);
        }
        if recovered > 0 {
            warn!(recovered, "returned in-flight queue items to pending");
        }

        let queue = Self {
            store,
            config,
            clock,
            state: Mutex::new(QueueState {
                items,
                next_seq,
                status: QueueStatus::default(),
                throughput: None,
            }),
        };
        {
            let mut state = queue.state.lock();
            queue.recompute(&mut state);
        }
        Ok(queue)
    }

    /// The queue settings.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Appends a mutation and applies it to the replica.
    ///
    /// A delete removes earlier `Pending` items for the same entity.
    ///
    /// # Errors
    ///
    /// [`CoreError::StorageFull`] when the queue or the store is at capacity.
    pub fn enqueue(&self, mutation: Mutation) -> CoreResult<QueueItem> {
        mutation.validate()?;
        let now = self.clock.now_millis();
        let entity = mutation.entity_ref();
        let mut state = self.state.lock();

        let record = self.store.get_entity(&entity)?;
        let (base_version, base_payload) = match record.as_ref() {
            Some(r) => match &r.synced {
                Some(s) => (Some(s.version), s.payload.clone()),
                None => (None, None),
            },
            None => Self::entity_items(&state, &entity)
                .last()
                .map_or((None, None), |i| (i.base_version, i.base_payload.clone())),
        };

        let payload_size = match &mutation.payload {
            Some(p) => encode(p)?.len() as u64,
            None => 0,
        };
        let requested = state.status.queue_size_bytes + payload_size;
        if requested > self.config.capacity_bytes {
            return Err(CoreError::StorageFull {
                requested,
                capacity: self.config.capacity_bytes,
            });
        }

        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            seq: state.next_seq,
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id,
            operation: mutation.operation,
            payload: mutation.payload,
            base_version,
            base_payload,
            local_timestamp: mutation.local_timestamp.unwrap_or(now),
            attempt_count: 0,
            priority: mutation.priority,
            status: QueueItemStatus::Pending,
            next_attempt_at: 0,
            last_error: None,
            conflict_id: None,
            payload_size,
        };
        self.store.put_typed(Keyspace::Queue, &item.id, &item)?;

        if let Err(e) = self.apply_to_replica(&item, record) {
            self.store.delete(Keyspace::Queue, &item.id)?;
            return Err(e);
        }
        state.next_seq += 1;

        if item.operation == Operation::Delete {
            let voided: Vec<String> = Self::entity_items(&state, &entity)
                .into_iter()
                .filter(|i| i.status == QueueItemStatus::Pending)
                .map(|i| i.id.clone())
                .collect();
            for id in voided {
                self.store.delete(Keyspace::Queue, &id)?;
                state.items.remove(&id);
                debug!(item = %id, entity = %entity, "voided by delete");
            }
        }

        debug!(
            item = %item.id,
            entity = %entity,
            operation = ?item.operation,
            priority = item.priority,
            "enqueued"
        );
        state.items.insert(item.id.clone(), item.clone());
        self.recompute(&mut state);
        Ok(item)
    }

    fn apply_to_replica(&self, item: &QueueItem, record: Option<EntityRecord>) -> CoreResult<()> {
        match (&item.payload, record) {
            (Some(payload), Some(mut record)) => {
                record.set_payload(payload.clone(), item.local_timestamp)?;
                self.store.put_entity(&record)?;
            }
            (Some(payload), None) => {
                let record = EntityRecord::new(item.entity_id.as_str(), payload.clone(), item.local_timestamp)?;
                self.store.put_entity(&record)?;
            }
            (None, _) => {
                self.store.delete_entity(&item.entity_ref())?;
            }
        }
        Ok(())
    }

    /// Hands out up to `max_items` eligible items totalling at most `max_bytes`
    /// and marks them `InFlight`.
    pub fn dequeue_batch(&self, max_items: usize, max_bytes: u64) -> CoreResult<Vec<QueueItem>> {
        self.dequeue_batch_filtered(max_items, max_bytes, &BatchFilter::all())
    }

    /// [`dequeue_batch`](Self::dequeue_batch) restricted by `filter`.
    ///
    /// Returned items are in delivery order. A first item larger than
    /// `max_bytes` is returned alone.
    pub fn dequeue_batch_filtered(
        &self,
        max_items: usize,
        max_bytes: u64,
        filter: &BatchFilter,
    ) -> CoreResult<Vec<QueueItem>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let mut groups: BTreeMap<EntityRef, Vec<&QueueItem>> = BTreeMap::new();
        for item in state.items.values() {
            groups.entry(item.entity_ref()).or_default().push(item);
        }

        // (priority, order key, entity, position in entity, id, size)
        let mut candidates = Vec::new();
        for (entity, mut group) in groups {
            group.sort_by_key(|i| i.order_key());
            for (pos, item) in group.into_iter().enumerate() {
                let eligible = item.status == QueueItemStatus::Pending
                    && item.next_attempt_at <= now
                    && filter.admits(item);
                if !eligible {
                    break;
                }
                candidates.push((
                    !item.priority,
                    item.order_key(),
                    entity.clone(),
                    pos,
                    item.id.clone(),
                    item.payload_size,
                ));
            }
        }
        candidates.sort();

        let mut selected: Vec<String> = Vec::new();
        let mut taken: HashMap<EntityRef, usize> = HashMap::new();
        let mut skipped: Vec<bool> = vec![false; candidates.len()];
        let mut bytes = 0u64;

        'fill: loop {
            let mut progress = false;
            for (idx, (_, _, entity, pos, id, size)) in candidates.iter().enumerate() {
                if skipped[idx] || selected.len() >= max_items {
                    continue;
                }
                if taken.get(entity).copied().unwrap_or(0) != *pos {
                    continue;
                }
                if selected.is_empty() && *size > max_bytes {
                    selected.push(id.clone());
                    break 'fill;
                }
                if bytes + size > max_bytes {
                    continue;
                }
                bytes += size;
                selected.push(id.clone());
                skipped[idx] = true;
                *taken.entry(entity.clone()).or_insert(0) += 1;
                progress = true;
            }
            if !progress || selected.len() >= max_items {
                break;
            }
        }

        let mut batch = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(item) = state.items.get_mut(&id) {
                item.status = QueueItemStatus::InFlight;
                self.store.put_typed(Keyspace::Queue, &item.id, &*item)?;
                batch.push(item.clone());
            }
        }
        if !batch.is_empty() {
            debug!(items = batch.len(), bytes, "dequeued batch");
            self.recompute(&mut state);
        }
        Ok(batch)
    }

    /// Removes an item the remote store applied.
    pub fn ack(&self, id: &str) -> CoreResult<QueueItem> {
        let mut state = self.state.lock();
        Self::expect_status(&state, id, &[QueueItemStatus::InFlight])?;
        self.store.delete(Keyspace::Queue, id)?;
        let item = state
            .items
            .remove(id)
            .ok_or_else(|| CoreError::queue_item_not_found(id))?;
        debug!(item = %id, entity = %item.entity_ref(), "acked");
        self.recompute(&mut state);
        Ok(item)
    }

    /// Records a failed delivery: back to `Pending` with exponential backoff,
    /// or `Failed` once the attempt limit is reached.
    pub fn nack(&self, id: &str, reason: &str) -> CoreResult<QueueItem> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        Self::expect_status(&state, id, &[QueueItemStatus::InFlight])?;

        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| CoreError::queue_item_not_found(id))?;
        item.attempt_count += 1;
        item.last_error = Some(reason.to_string());
        if item.attempt_count >= self.config.max_attempts {
            item.status = QueueItemStatus::Failed;
            warn!(item = %id, attempts = item.attempt_count, "queue item failed: {reason}");
        } else {
            let delay = self.config.backoff_for_attempt(item.attempt_count);
            item.status = QueueItemStatus::Pending;
            item.next_attempt_at = now + delay.as_millis() as u64;
            debug!(item = %id, attempts = item.attempt_count, retry_in_ms = delay.as_millis() as u64, "nacked: {reason}");
        }
        let item = item.clone();
        self.store.put_typed(Keyspace::Queue, id, &item)?;
        self.recompute(&mut state);
        Ok(item)
    }

    /// Returns an `InFlight` item to `Pending` without counting an attempt.
    pub fn release(&self, id: &str) -> CoreResult<()> {
        self.update(id, &[QueueItemStatus::InFlight], |item| {
            item.status = QueueItemStatus::Pending;
        })
        .map(|_| ())
    }

    /// Parks an item behind a conflict awaiting manual review.
    pub fn park(&self, id: &str, conflict_id: &str) -> CoreResult<QueueItem> {
        let item = self.update(
            id,
            &[QueueItemStatus::InFlight, QueueItemStatus::Pending],
            |item| {
                item.status = QueueItemStatus::Failed;
                item.conflict_id = Some(conflict_id.to_string());
            },
        )?;
        info!(item = %id, conflict = %conflict_id, "parked for manual review");
        Ok(item)
    }

    /// Returns a parked item to `Pending` with new content.
    pub fn unpark(&self, id: &str, rebase: Rebase) -> CoreResult<QueueItem> {
        self.rewrite(id, &[QueueItemStatus::Failed], rebase)
    }

    /// Returns an `InFlight` item to `Pending` with content chosen by the resolver.
    pub fn requeue_resolved(&self, id: &str, rebase: Rebase) -> CoreResult<QueueItem> {
        self.rewrite(id, &[QueueItemStatus::InFlight, QueueItemStatus::Pending], rebase)
    }

    fn rewrite(&self, id: &str, allowed: &[QueueItemStatus], rebase: Rebase) -> CoreResult<QueueItem> {
        let payload_size = match &rebase.payload {
            Some(p) => encode(p)?.len() as u64,
            None => 0,
        };
        let now = self.clock.now_millis();
        self.update(id, allowed, move |item| {
            if item.status == QueueItemStatus::Failed {
                item.attempt_count = 0;
            }
            item.status = QueueItemStatus::Pending;
            item.conflict_id = None;
            item.next_attempt_at = now;
            item.operation = rebase.operation;
            item.payload = rebase.payload;
            item.base_version = rebase.base_version;
            item.base_payload = rebase.base_payload;
            item.payload_size = payload_size;
        })
    }

    /// Removes an item in any state.
    pub fn discard(&self, id: &str) -> CoreResult<Option<QueueItem>> {
        let mut state = self.state.lock();
        let Some(item) = state.items.remove(id) else {
            return Ok(None);
        };
        self.store.delete(Keyspace::Queue, id)?;
        debug!(item = %id, entity = %item.entity_ref(), "discarded");
        self.recompute(&mut state);
        Ok(Some(item))
    }

    /// Points the remaining items of `entity` at a new server version.
    ///
    /// Parked items keep their base; their conflict record refers to it.
    pub fn rebase_entity(
        &self,
        entity: &EntityRef,
        version: u64,
        payload: Option<EntityPayload>,
    ) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let ids: Vec<String> = Self::entity_items(&state, entity)
            .into_iter()
            .filter(|i| !i.is_parked())
            .map(|i| i.id.clone())
            .collect();
        for id in &ids {
            if let Some(item) = state.items.get_mut(id) {
                item.base_version = Some(version);
                item.base_payload = payload.clone();
                self.store.put_typed(Keyspace::Queue, id, &*item)?;
            }
        }
        Ok(ids.len())
    }

    /// Moves failed items that are not parked back to `Pending`.
    pub fn retry_failed(&self) -> CoreResult<usize> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let mut count = 0;
        for item in state.items.values_mut() {
            if item.status == QueueItemStatus::Failed && item.conflict_id.is_none() {
                item.status = QueueItemStatus::Pending;
                item.attempt_count = 0;
                item.next_attempt_at = now;
                self.store.put_typed(Keyspace::Queue, &item.id, &*item)?;
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "failed items returned to pending");
            self.recompute(&mut state);
        }
        Ok(count)
    }

    /// One item.
    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.state.lock().items.get(id).cloned()
    }

    /// All items in `(local_timestamp, seq)` order.
    pub fn items(&self) -> Vec<QueueItem> {
        let state = self.state.lock();
        let mut items: Vec<_> = state.items.values().cloned().collect();
        items.sort_by_key(|i| i.order_key());
        items
    }

    /// Items of one entity in delivery order.
    pub fn items_for(&self, entity: &EntityRef) -> Vec<QueueItem> {
        Self::entity_items(&self.state.lock(), entity)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Whether any item targets `entity`.
    pub fn has_items_for(&self, entity: &EntityRef) -> bool {
        self.state
            .lock()
            .items
            .values()
            .any(|i| i.entity_type == entity.entity_type && i.entity_id == entity.entity_id)
    }

    /// The cached summary.
    pub fn status(&self) -> QueueStatus {
        self.state.lock().status.clone()
    }

    /// Feeds the drain time estimate with the latest link measurements.
    pub fn set_throughput_hint(&self, bandwidth_kbps: Option<u32>, latency_ms: Option<u32>) {
        let mut state = self.state.lock();
        state.throughput = match (bandwidth_kbps, latency_ms) {
            (Some(kbps), latency) if kbps > 0 => Some(ThroughputHint {
                kbps,
                latency_ms: latency.unwrap_or(0),
            }),
            _ => None,
        };
        self.recompute(&mut state);
    }

    fn entity_items<'a>(state: &'a QueueState, entity: &EntityRef) -> Vec<&'a QueueItem> {
        let mut items: Vec<_> = state
            .items
            .values()
            .filter(|i| i.entity_type == entity.entity_type && i.entity_id == entity.entity_id)
            .collect();
        items.sort_by_key(|i| i.order_key());
        items
    }

    fn expect_status(state: &QueueState, id: &str, allowed: &[QueueItemStatus]) -> CoreResult<()> {
        let item = state
            .items
            .get(id)
            .ok_or_else(|| CoreError::queue_item_not_found(id))?;
        if allowed.contains(&item.status) {
            Ok(())
        } else {
            Err(CoreError::InvalidQueueState {
                id: id.to_string(),
                expected: format!("{allowed:?}"),
                actual: format!("{:?}", item.status),
            })
        }
    }

    fn update<F>(&self, id: &str, allowed: &[QueueItemStatus], f: F) -> CoreResult<QueueItem>
    where
        F: FnOnce(&mut QueueItem),
    {
        let mut state = self.state.lock();
        Self::expect_status(&state, id, allowed)?;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| CoreError::queue_item_not_found(id))?;
        f(item);
        let item = item.clone();
        self.store.put_typed(Keyspace::Queue, id, &item)?;
        self.recompute(&mut state);
        Ok(item)
    }

    fn recompute(&self, state: &mut QueueState) {
        let mut status = QueueStatus::default();
        let mut drain_bytes = 0u64;
        let mut drain_items = 0u64;

        for item in state.items.values() {
            status.total_items += 1;
            match item.status {
                QueueItemStatus::Pending => status.pending_items += 1,
                QueueItemStatus::InFlight => status.in_flight_items += 1,
                QueueItemStatus::Failed => status.failed_items += 1,
            }
            if item.status != QueueItemStatus::Failed {
                drain_bytes += item.payload_size;
                drain_items += 1;
            }
            if item.priority {
                status.priority_items += 1;
            }
            status.queue_size_bytes += item.payload_size;
            *status.items_by_type.entry(item.entity_type).or_insert(0) += 1;
            status.oldest_item = Some(
                status
                    .oldest_item
                    .map_or(item.local_timestamp, |t: Timestamp| t.min(item.local_timestamp)),
            );
        }

        status.estimated_sync_millis = state.throughput.map(|hint| {
            drain_items * u64::from(hint.latency_ms) + drain_bytes * 8 / u64::from(hint.kbps)
        });
        state.status = status;
    }
}
