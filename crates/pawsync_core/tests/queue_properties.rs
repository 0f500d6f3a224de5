//! Property tests for the change queue's delivery guarantees.

use pawsync_core::{ChangeQueue, CoreError, QueueConfig};
use pawsync_protocol::{EntityPayload, Feeding, Mutation};
use pawsync_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

fn grams(payload: &Option<EntityPayload>) -> Option<u32> {
    match payload {
        Some(EntityPayload::Feeding(Feeding { amount_grams, .. })) => Some(*amount_grams),
        _ => None,
    }
}

proptest! {
    #[test]
    fn drain_applies_each_entity_in_timestamp_order(
        updates in update_sequence_strategy(4, 30),
        batch_size in 1usize..8,
    ) {
        let engine = TestEngine::new();
        for update in &updates {
            engine.queue.enqueue(update.mutation()).unwrap();
        }

        let mut remote: HashMap<String, u32> = HashMap::new();
        let mut applied: HashMap<String, Vec<u64>> = HashMap::new();
        loop {
            let batch = engine.queue.dequeue_batch(batch_size, u64::MAX).unwrap();
            if batch.is_empty() {
                break;
            }
            for item in batch {
                remote.insert(item.entity_id.clone(), grams(&item.payload).unwrap());
                applied.entry(item.entity_id.clone()).or_default().push(item.local_timestamp);
                engine.queue.ack(&item.id).unwrap();
            }
        }

        prop_assert_eq!(engine.queue.status().total_items, 0);
        for timestamps in applied.values() {
            prop_assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        }

        // Last write by (timestamp, enqueue order) wins.
        let mut expected: HashMap<String, (u64, usize, u32)> = HashMap::new();
        for (idx, u) in updates.iter().enumerate() {
            let key = (u.timestamp, idx, u.grams);
            let slot = expected.entry(u.entity_id.clone()).or_insert(key);
            if (key.0, key.1) > (slot.0, slot.1) {
                *slot = key;
            }
        }
        for (entity, (_, _, g)) in expected {
            prop_assert_eq!(remote.get(&entity).copied(), Some(g));
        }
    }

    #[test]
    fn acked_items_are_never_handed_out_again(
        updates in update_sequence_strategy(3, 20),
        ack_mask in prop::collection::vec(any::<bool>(), 20),
    ) {
        let engine = TestEngine::new();
        for update in &updates {
            engine.queue.enqueue(update.mutation()).unwrap();
        }

        let mut acked: HashSet<String> = HashSet::new();
        let mut round = 0;
        loop {
            let batch = engine.queue.dequeue_batch(4, u64::MAX).unwrap();
            if batch.is_empty() {
                break;
            }
            for item in batch {
                prop_assert!(!acked.contains(&item.id));
                if ack_mask[round % ack_mask.len()] || round > 40 {
                    engine.queue.ack(&item.id).unwrap();
                    acked.insert(item.id);
                } else {
                    engine.queue.release(&item.id).unwrap();
                }
                round += 1;
            }
        }
        prop_assert_eq!(acked.len(), updates.len());
    }
}

#[test]
fn ack_requires_in_flight() {
    let engine = TestEngine::new();
    let item = engine
        .queue
        .enqueue(Mutation::create("1", payloads::feeding("rex", 80)))
        .unwrap();
    assert!(matches!(
        engine.queue.ack(&item.id),
        Err(CoreError::InvalidQueueState { .. })
    ));
}

#[test]
fn queue_survives_file_reopen() {
    with_file_store(|store, _| {
        let clock = std::sync::Arc::new(pawsync_core::ManualClock::new(TEST_EPOCH));
        let queue = ChangeQueue::open(store.store.clone(), QueueConfig::default(), clock.clone()).unwrap();
        queue
            .enqueue(Mutation::update("7", payloads::feeding("rex", 100)).with_timestamp(1))
            .unwrap();
        queue
            .enqueue(Mutation::update("7", payloads::feeding("rex", 150)).with_timestamp(2))
            .unwrap();
        drop(queue);

        let queue = ChangeQueue::open(store.store.clone(), QueueConfig::default(), clock).unwrap();
        let items = queue.items();
        assert_eq!(items.len(), 2);
        assert_eq!(grams(&items[1].payload), Some(150));
    });
}
