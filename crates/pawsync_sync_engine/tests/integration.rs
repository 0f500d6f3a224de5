//! End-to-end sync scenarios against the in-memory remote store.

use pawsync_core::{CoreError, EngineConfig, LocalStore, ManualClock};
use pawsync_protocol::{
    ConnectionType, EntityRef, EntityType, ManualChoice, Mutation, NetworkStateSample,
    QueueItemStatus, Resolution, SyncType,
};
use pawsync_sync_engine::{
    spawn_worker, CycleOutcome, DeferReason, InterruptReason, MemoryRemoteStore, NetworkMonitor,
    RemoteError, SyncError, SyncEvent, SyncScheduler, SyncTrigger,
};
use pawsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Device {
    clock: Arc<ManualClock>,
    remote: Arc<MemoryRemoteStore>,
    network: Arc<NetworkMonitor>,
    scheduler: Arc<SyncScheduler>,
}

impl Device {
    fn new(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let remote = Arc::new(MemoryRemoteStore::new(clock.clone()));
        let network = Arc::new(NetworkMonitor::new(clock.clone(), 16));
        let scheduler =
            SyncScheduler::open(config, store, remote.clone(), network.clone(), clock.clone())
                .unwrap();
        scheduler.migrations().migrate_to_latest().unwrap();
        Self {
            clock,
            remote,
            network,
            scheduler: Arc::new(scheduler),
        }
    }

    fn online(self) -> Self {
        self.network.record(NetworkStateSample::connected(
            ConnectionType::Wifi,
            Some(10_000),
            Some(15),
            TEST_EPOCH,
        ));
        self
    }

    fn tick(&self) {
        self.clock.advance(Duration::from_millis(10));
    }

    async fn sync(&self) -> pawsync_sync_engine::SyncReport {
        self.scheduler
            .run_cycle(SyncTrigger::Explicit, SyncType::Incremental)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn offline_edits_reach_the_server_in_order() {
    let device = Device::new(EngineConfig::default());
    device
        .scheduler
        .enqueue(Mutation::create("7", payloads::feeding("rex", 100)))
        .unwrap();
    device.tick();
    device
        .scheduler
        .enqueue(Mutation::update("7", payloads::feeding("rex", 150)))
        .unwrap();

    let report = device.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Deferred(DeferReason::Offline));

    let device = device.online();
    let report = device.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.pushed, 2);

    let doc = device.remote.document("feedings", "7").unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(doc.data, Some(payloads::feeding("rex", 150)));
    assert!(device.scheduler.queue().items().is_empty());
}

#[tokio::test]
async fn later_local_edit_wins_a_concurrent_feeding_change() {
    let device = Device::new(EngineConfig::default()).online();
    device
        .scheduler
        .enqueue(Mutation::create("8", payloads::feeding("rex", 100)))
        .unwrap();
    device.sync().await;

    device
        .remote
        .server_write("feedings", "8", payloads::feeding("rex", 120));
    device.clock.advance(Duration::from_secs(1));
    device
        .scheduler
        .enqueue(Mutation::update("8", payloads::feeding("rex", 200)))
        .unwrap();

    let report = device.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Conflicted);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.parked, 0);

    let doc = device.remote.document("feedings", "8").unwrap();
    assert_eq!(doc.version, 3);
    assert_eq!(doc.data, Some(payloads::feeding("rex", 200)));
    assert_eq!(device.scheduler.resolver().unresolved_count(), 0);
}

#[tokio::test]
async fn medication_dosage_conflict_waits_for_a_person() {
    let device = Device::new(EngineConfig::default()).online();
    let mut events = device.scheduler.subscribe();
    device
        .scheduler
        .enqueue(Mutation::create("3", payloads::medication("rex", "2.5mg")))
        .unwrap();
    device.sync().await;

    device
        .remote
        .server_write("medications", "3", payloads::medication("rex", "7mg"));
    device.tick();
    let item = device
        .scheduler
        .enqueue(Mutation::update("3", payloads::medication("rex", "5mg")))
        .unwrap();

    let report = device.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Conflicted);
    assert_eq!(report.parked, 1);

    let conflicts = device
        .scheduler
        .resolver()
        .list_conflicts(&pawsync_core::ConflictFilter::unresolved());
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.resolution, Resolution::Pending);
    assert!(conflict.conflicting_fields.iter().any(|f| f == "dosage"));
    assert_eq!(device.scheduler.state().conflicts, 1);

    let parked = device.scheduler.queue().get(&item.id).unwrap();
    assert_eq!(parked.status, QueueItemStatus::Failed);
    assert_eq!(parked.conflict_id.as_deref(), Some(conflict.id.as_str()));

    let mut recorded = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ConflictRecorded { resolution, .. } = event {
            assert_eq!(resolution, Resolution::Pending);
            recorded = true;
        }
    }
    assert!(recorded);

    // A parked item is not retried by later cycles.
    let report = device.sync().await;
    assert_eq!(report.pushed, 0);
    assert_eq!(
        device.remote.document("medications", "3").unwrap().data,
        Some(payloads::medication("rex", "7mg"))
    );

    let resolved = device
        .scheduler
        .resolve_conflict(&conflict.id, ManualChoice::KeepLocal, "vet")
        .unwrap();
    assert_eq!(resolved.resolution, Resolution::LocalWins);
    assert_eq!(resolved.resolved_by.as_deref(), Some("vet"));

    let report = device.sync().await;
    assert_eq!(report.pushed, 1);
    let doc = device.remote.document("medications", "3").unwrap();
    assert_eq!(doc.data, Some(payloads::medication("rex", "5mg")));

    let err = device
        .scheduler
        .resolve_conflict(&conflict.id, ManualChoice::KeepServer, "vet")
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Core(CoreError::AlreadyResolved { .. })
    ));
}

#[tokio::test]
async fn losing_connectivity_mid_drain_keeps_acknowledged_work() {
    let device = Device::new(EngineConfig::default()).online();
    let mut ids = Vec::new();
    for (id, grams) in [("a", 50), ("b", 60), ("c", 70)] {
        let item = device
            .scheduler
            .enqueue(Mutation::create(id, payloads::feeding("rex", grams)))
            .unwrap();
        ids.push(item.id);
        device.tick();
    }

    device.remote.hold_writes_after(1);
    let cycle = tokio::spawn({
        let scheduler = Arc::clone(&device.scheduler);
        async move {
            scheduler
                .run_cycle(SyncTrigger::Explicit, SyncType::Incremental)
                .await
        }
    });
    device.remote.wait_for_write_attempts(2).await;
    device.network.mark_disconnected();

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        CycleOutcome::Interrupted(InterruptReason::ConnectivityLost)
    );
    assert_eq!(report.pushed, 1);

    let queue = device.scheduler.queue();
    assert!(queue.get(&ids[0]).is_none());
    let second = queue.get(&ids[1]).unwrap();
    assert_eq!(second.status, QueueItemStatus::Pending);
    assert_eq!(second.attempt_count, 1);
    let third = queue.get(&ids[2]).unwrap();
    assert_eq!(third.status, QueueItemStatus::Pending);
    assert_eq!(third.attempt_count, 0);
    assert!(!device.scheduler.state().sync_in_progress);

    device.remote.release_writes();
    let device = device.online();
    device.clock.advance(Duration::from_secs(5));
    let report = device.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.pushed, 2);
    assert_eq!(device.remote.documents("feedings").len(), 3);
}

#[tokio::test]
async fn wifi_only_defers_on_metered_links() {
    let mut config = EngineConfig::default();
    config.sync_on_wifi_only = true;
    let device = Device::new(config);
    device.network.record(NetworkStateSample::connected(
        ConnectionType::Mobile4G,
        Some(4_000),
        Some(50),
        TEST_EPOCH,
    ));
    device
        .scheduler
        .enqueue(Mutation::create("rex", payloads::dog("Rex")))
        .unwrap();

    let report = device.sync().await;
    assert_eq!(
        report.outcome,
        CycleOutcome::Deferred(DeferReason::MeteredConnection)
    );
    assert_eq!(device.scheduler.queue().status().pending_items, 1);

    let device = device.online();
    let report = device.sync().await;
    assert_eq!(report.pushed, 1);
}

#[tokio::test]
async fn incremental_pull_fetches_only_new_changes() {
    let device = Device::new(EngineConfig::default()).online();
    device
        .remote
        .server_write("dogs", "bella", payloads::dog("Bella"));
    device.tick();

    let report = device
        .scheduler
        .run_cycle(SyncTrigger::Explicit, SyncType::Initial)
        .await
        .unwrap();
    assert_eq!(report.pulled, 1);

    device.tick();
    device
        .remote
        .server_write("feedings", "f1", payloads::feeding("bella", 80));
    let report = device.sync().await;
    assert_eq!(report.pulled, 1);

    let store = device.scheduler.store();
    assert!(store.entity_exists(&EntityRef::new(EntityType::Dog, "bella")));
    let feeding = store
        .get_entity(&EntityRef::new(EntityType::Feeding, "f1"))
        .unwrap()
        .unwrap();
    assert_eq!(feeding.synced_version(), Some(1));
}

#[tokio::test]
async fn queued_local_changes_are_not_overwritten_by_pull() {
    let device = Device::new(EngineConfig::default()).online();
    device
        .scheduler
        .enqueue(Mutation::create("rex", payloads::dog("Rex")))
        .unwrap();
    device.sync().await;

    device.tick();
    device
        .scheduler
        .enqueue(Mutation::update("rex", payloads::dog("Rex Jr")))
        .unwrap();
    device.remote.server_write("dogs", "rex", payloads::dog("Rexy"));
    device.remote.fail_next(RemoteError::Timeout);

    // The push times out and backs off; the pull then sees rex still queued.
    let report = device.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.retried, 1);
    assert_eq!(report.pulled, 0);

    let local = device
        .scheduler
        .store()
        .get_entity(&EntityRef::new(EntityType::Dog, "rex"))
        .unwrap()
        .unwrap();
    assert_eq!(local.payload, payloads::dog("Rex Jr"));
    assert_eq!(local.synced_version(), Some(1));
}

#[tokio::test]
async fn refused_credentials_halt_the_worker_until_cleared() {
    let device = Device::new(EngineConfig::default()).online();
    let handle = spawn_worker(Arc::clone(&device.scheduler));
    let mut events = handle.subscribe();
    device.remote.set_authorized(false);
    device
        .scheduler
        .enqueue(Mutation::create("rex", payloads::dog("Rex")))
        .unwrap();

    let err = handle.request_sync(SyncType::Full).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(device.scheduler.is_halted());

    let mut fatal = false;
    while let Ok(event) = events.try_recv() {
        fatal |= matches!(event, SyncEvent::Fatal { .. });
    }
    assert!(fatal);

    device.remote.set_authorized(true);
    let err = handle.request_sync(SyncType::Full).await.unwrap_err();
    assert!(matches!(err, SyncError::Halted { .. }));

    handle.clear_fatal().unwrap();
    let report = handle.request_sync(SyncType::Full).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert!(device.remote.document("dogs", "rex").is_some());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_cycle_leaves_remaining_items_queued() {
    let device = Device::new(EngineConfig::default()).online();
    for id in ["a", "b"] {
        device
            .scheduler
            .enqueue(Mutation::create(id, payloads::feeding("rex", 90)))
            .unwrap();
        device.tick();
    }

    device.remote.hold_writes_after(1);
    let cycle = tokio::spawn({
        let scheduler = Arc::clone(&device.scheduler);
        async move {
            scheduler
                .run_cycle(SyncTrigger::Explicit, SyncType::Incremental)
                .await
        }
    });
    device.remote.wait_for_write_attempts(2).await;
    device.scheduler.cancel();
    device.remote.release_writes();

    let report = cycle.await.unwrap().unwrap();
    // The in-flight item completes; cancellation stops before the next one.
    assert_eq!(report.pushed, 2);
    assert!(matches!(
        report.outcome,
        CycleOutcome::Completed | CycleOutcome::Interrupted(InterruptReason::Cancelled)
    ));
    assert!(device.scheduler.queue().items().is_empty());
}
