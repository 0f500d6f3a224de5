//! Sync state machine.
//!
//! A cycle moves `Idle → Evaluating → Syncing → (Conflicted | Failed) → Idle`.
//! Evaluation checks the fatal gates (halt, migrations) and the sync policy
//! (connectivity, metered links, backoff). Syncing drains the change queue
//! against the remote store and pulls remote changes into the replica.
//!
//! Only one cycle runs at a time; a trigger that arrives while a cycle is
//! active returns [`CycleOutcome::Skipped`] and the caller's mutation waits
//! in the queue for the next cycle.

use crate::error::{SyncError, SyncResult};
use crate::network::{self, NetworkMonitor};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use pawsync_core::{
    BatchFilter, ChangeQueue, ConflictResolver, CoreError, EngineConfig, EntityRecord,
    IntegrityChecker, LocalStore, MigrationRunner, OfflineMode, PolicyTable, Rebase,
    ResolutionAction, SharedClock, SyncedVersion,
};
use pawsync_protocol::{
    CheckType, ConflictRecord, ConnectionQuality, EntityRef, EntityType, ListFilter, ManualChoice, Mutation,
    NetworkStateSample, Operation, QueueItem, QueueItemStatus, RemoteDocument, Resolution,
    SyncStateRecord, SyncType, Timestamp,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// No cycle running.
    Idle,
    /// Deciding whether to sync now.
    Evaluating,
    /// Draining and pulling.
    Syncing,
    /// The cycle ended with conflicts handed to the resolver.
    Conflicted,
    /// The cycle ended with an error.
    Failed,
}

impl SyncPhase {
    /// Returns true while a cycle holds the sync lock.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncPhase::Evaluating | SyncPhase::Syncing)
    }
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// A mutation was enqueued.
    Enqueue,
    /// The sync interval elapsed.
    Timer,
    /// The host asked.
    Explicit,
    /// The network came back.
    ConnectivityRegained,
    /// The failure backoff elapsed.
    Retry,
}

/// Why evaluation declined to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// No connectivity.
    Offline,
    /// Wifi-only sync on a metered link.
    MeteredConnection,
    /// Advanced offline mode waits out poor links.
    PoorConnection,
    /// A previous failure's backoff has not elapsed.
    BackingOff {
        /// When the backoff ends.
        until: Timestamp,
    },
}

/// Why a running cycle stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The host cancelled the sync.
    Cancelled,
    /// Connectivity was lost.
    ConnectivityLost,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Everything drained and pulled.
    Completed,
    /// Drained, with conflicts handed to the resolver.
    Conflicted,
    /// Evaluation declined to sync.
    Deferred(DeferReason),
    /// Stopped early; acknowledged work stays acknowledged.
    Interrupted(InterruptReason),
    /// A transient error ended the cycle; a retry is scheduled.
    Failed {
        /// The error.
        error: String,
    },
    /// Another cycle was running.
    Skipped,
}

/// Summary of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// What started the cycle.
    pub trigger: SyncTrigger,
    /// Requested sync type.
    pub sync_type: SyncType,
    /// How it ended.
    pub outcome: CycleOutcome,
    /// Items applied remotely.
    pub pushed: usize,
    /// Remote documents applied to the replica.
    pub pulled: usize,
    /// Conflicts recorded.
    pub conflicts: usize,
    /// Items parked for manual review.
    pub parked: usize,
    /// Items returned to the queue with a failed attempt.
    pub retried: usize,
    /// Cycle start.
    pub started_at: Timestamp,
    /// Cycle end.
    pub finished_at: Timestamp,
}

impl SyncReport {
    fn new(trigger: SyncTrigger, sync_type: SyncType, started_at: Timestamp) -> Self {
        Self {
            trigger,
            sync_type,
            outcome: CycleOutcome::Skipped,
            pushed: 0,
            pulled: 0,
            conflicts: 0,
            parked: 0,
            retried: 0,
            started_at,
            finished_at: started_at,
        }
    }
}

/// Notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The state machine moved.
    PhaseChanged(SyncPhase),
    /// The resolver recorded a conflict.
    ConflictRecorded {
        /// Conflict record id.
        conflict_id: String,
        /// Entity in conflict.
        entity: EntityRef,
        /// Resolution applied, `Pending` when parked.
        resolution: Resolution,
    },
    /// A cycle ended.
    CycleFinished(SyncReport),
    /// Syncing stopped on a fatal error.
    Fatal {
        /// The error.
        message: String,
    },
}

enum Call<T> {
    Done(RemoteResult<T>),
    TimedOut,
    Disconnected,
}

enum Delivery {
    Applied,
    /// Later items of the same entity must wait for the next batch.
    Blocked,
    Disconnected,
}

/// Drives the change queue against the remote store.
pub struct SyncScheduler {
    config: EngineConfig,
    store: Arc<LocalStore>,
    queue: Arc<ChangeQueue>,
    resolver: Arc<ConflictResolver>,
    migrations: Arc<MigrationRunner>,
    integrity: Arc<IntegrityChecker>,
    remote: Arc<dyn RemoteStore>,
    network: Arc<NetworkMonitor>,
    clock: SharedClock,
    state: Mutex<SyncStateRecord>,
    active: tokio::sync::Mutex<()>,
    phase: watch::Sender<SyncPhase>,
    events: broadcast::Sender<SyncEvent>,
    cancel: AtomicBool,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("user_id", &self.config.user_id)
            .field("phase", &*self.phase.borrow())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    /// Opens the scheduler and the queue, resolver and migration runner it
    /// owns over `store`.
    ///
    /// A `sync_in_progress` flag left behind by a crash is cleared.
    pub fn open(
        config: EngineConfig,
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<NetworkMonitor>,
        clock: SharedClock,
    ) -> SyncResult<Self> {
        let queue = Arc::new(ChangeQueue::open(
            Arc::clone(&store),
            config.queue.clone(),
            Arc::clone(&clock),
        )?);
        let resolver = Arc::new(ConflictResolver::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            PolicyTable::from_config(&config),
            Arc::clone(&clock),
        ));
        let migrations = Arc::new(MigrationRunner::with_builtin(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.user_id.as_str(),
        )?);

        let integrity = Arc::new(
            IntegrityChecker::new(Arc::clone(&store), Arc::clone(&queue), Arc::clone(&clock))
                .with_results_kept(config.retention.integrity_results_kept),
        );

        let mut state = store
            .load_sync_state(&config.user_id)?
            .unwrap_or_else(|| SyncStateRecord::new(config.user_id.as_str()));
        if state.sync_in_progress {
            warn!(user = %state.user_id, "clearing stale sync-in-progress flag");
            state.sync_in_progress = false;
            state.current_sync_type = None;
            store.save_sync_state(&state)?;
        }

        Ok(Self {
            config,
            store,
            queue,
            resolver,
            migrations,
            integrity,
            remote,
            network,
            clock,
            state: Mutex::new(state),
            active: tokio::sync::Mutex::new(()),
            phase: watch::channel(SyncPhase::Idle).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
            cancel: AtomicBool::new(false),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The change queue.
    pub fn queue(&self) -> &Arc<ChangeQueue> {
        &self.queue
    }

    /// The conflict resolver.
    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// The migration runner gating sync.
    pub fn migrations(&self) -> &Arc<MigrationRunner> {
        &self.migrations
    }

    /// The integrity checker.
    pub fn integrity(&self) -> &Arc<IntegrityChecker> {
        &self.integrity
    }

    /// The network monitor.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// A copy of the persisted sync state.
    pub fn state(&self) -> SyncStateRecord {
        self.state.lock().clone()
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// A receiver that always holds the current phase.
    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Subscribes to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Appends a local mutation to the change queue.
    ///
    /// Never waits for a running cycle.
    pub fn enqueue(&self, mutation: Mutation) -> SyncResult<QueueItem> {
        let item = self.queue.enqueue(mutation)?;
        self.update_state(|_| {})?;
        Ok(item)
    }

    /// Settles a conflict awaiting manual review.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ManualChoice,
        resolved_by: &str,
    ) -> SyncResult<ConflictRecord> {
        let record = self.resolver.resolve_manual(conflict_id, choice, resolved_by)?;
        self.update_state(|_| {})?;
        Ok(record)
    }

    /// Asks the running cycle to stop after its in-flight item.
    pub fn cancel(&self) {
        if self.phase().is_active() {
            info!("sync cancellation requested");
        }
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether a fatal error halted syncing.
    pub fn is_halted(&self) -> bool {
        self.state.lock().halted.is_some()
    }

    /// Lifts a halt after the host fixed its cause, for example after
    /// re-authentication.
    pub fn clear_fatal(&self) -> SyncResult<()> {
        let state = self.update_state(|state| {
            state.halted = None;
            state.last_error = None;
            state.consecutive_failures = 0;
            state.next_scheduled_sync = None;
        })?;
        info!(user = %state.user_id, "sync halt cleared");
        Ok(())
    }

    /// Backoff before retrying after the current run of failures.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let failures = self.state.lock().consecutive_failures;
        (failures > 0).then(|| self.config.failure_backoff.delay_for_attempt(failures))
    }

    /// Time until the earliest pending item leaves its nack backoff.
    pub fn next_item_ready(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        self.queue
            .items()
            .iter()
            .filter(|i| i.status == QueueItemStatus::Pending && i.next_attempt_at > now)
            .map(|i| i.next_attempt_at - now)
            .min()
            .map(Duration::from_millis)
    }

    /// Time until the scheduler wants another cycle without a new trigger:
    /// the end of the failure backoff or the earliest nacked item's retry.
    pub fn next_wakeup(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        let backoff = {
            let state = self.state.lock();
            state
                .next_scheduled_sync
                .filter(|until| state.consecutive_failures > 0 && *until > now)
                .map(|until| Duration::from_millis(until - now))
        };
        match (backoff, self.next_item_ready()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drops resolved conflicts and network samples older than the
    /// retention policy allows. Returns `(conflicts, samples)` dropped.
    pub fn prune_retention(&self) -> SyncResult<(usize, usize)> {
        let now = self.clock.now_millis();
        let retention = &self.config.retention;
        let conflicts = self
            .resolver
            .prune_resolved(now.saturating_sub(retention.resolved_conflicts_secs * 1000))?;
        let samples = self
            .store
            .prune_network_samples(now.saturating_sub(retention.network_samples_secs * 1000))?;
        if conflicts + samples > 0 {
            debug!(conflicts, samples, "retention pruned");
        }
        Ok((conflicts, samples))
    }

    /// Runs one cycle.
    ///
    /// Transient failures are reported in the returned [`SyncReport`] and
    /// scheduled for retry.
    ///
    /// # Errors
    ///
    /// Only fatal errors: a halt, an unmigrated or too-new schema, refused
    /// credentials, or a full local store.
    pub async fn run_cycle(
        &self,
        trigger: SyncTrigger,
        sync_type: SyncType,
    ) -> SyncResult<SyncReport> {
        let mut report = SyncReport::new(trigger, sync_type.clone(), self.clock.now_millis());
        let Ok(_active) = self.active.try_lock() else {
            debug!(?trigger, "sync already running");
            return Ok(report);
        };

        let result = self.cycle(trigger, &sync_type, &mut report).await;
        report.finished_at = self.clock.now_millis();
        self.set_phase(SyncPhase::Idle);
        let outcome = result?;

        report.outcome = outcome;
        info!(
            ?trigger,
            sync_type = %sync_type,
            outcome = ?report.outcome,
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            "sync cycle finished"
        );
        self.emit(SyncEvent::CycleFinished(report.clone()));
        Ok(report)
    }

    async fn cycle(
        &self,
        trigger: SyncTrigger,
        sync_type: &SyncType,
        report: &mut SyncReport,
    ) -> SyncResult<CycleOutcome> {
        self.set_phase(SyncPhase::Evaluating);
        if let Err(e) = self.gate() {
            self.record_fatal(&e);
            return Err(e);
        }
        if let Some(reason) = self.evaluate(trigger, sync_type) {
            self.defer(reason)?;
            return Ok(CycleOutcome::Deferred(reason));
        }

        self.cancel.store(false, Ordering::SeqCst);
        self.update_state(|state| {
            state.sync_in_progress = true;
            state.current_sync_type = Some(sync_type.clone());
        })?;
        self.set_phase(SyncPhase::Syncing);
        debug!(?trigger, sync_type = %sync_type, "syncing");

        let outcome = match self.sync_body(sync_type, report).await {
            Ok(None) => {
                let started_at = report.started_at;
                let period = self.config.sync_interval.period();
                self.update_state(|state| {
                    state.sync_in_progress = false;
                    state.current_sync_type = None;
                    state.last_sync_timestamp = Some(started_at);
                    state.last_error = None;
                    state.consecutive_failures = 0;
                    state.next_scheduled_sync =
                        period.map(|p| started_at + p.as_millis() as u64);
                })?;
                if self.config.offline_mode == OfflineMode::Advanced {
                    self.quick_check();
                }
                if report.conflicts > 0 {
                    self.set_phase(SyncPhase::Conflicted);
                    CycleOutcome::Conflicted
                } else {
                    CycleOutcome::Completed
                }
            }
            Ok(Some(reason)) => {
                info!(?reason, "sync interrupted");
                self.update_state(|state| {
                    state.sync_in_progress = false;
                    state.current_sync_type = None;
                })?;
                CycleOutcome::Interrupted(reason)
            }
            Err(e) if e.is_fatal() => {
                self.set_phase(SyncPhase::Failed);
                self.record_fatal(&e);
                return Err(e);
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                self.record_failure(&e)?;
                CycleOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        if let Err(e) = self.prune_retention() {
            warn!(error = %e, "retention pruning failed");
        }
        if let Err(e) = self.store.compact_if_needed() {
            warn!(error = %e, "store compaction failed");
        }
        Ok(outcome)
    }

    fn quick_check(&self) {
        match self.integrity.run_check(CheckType::Quick) {
            Ok(result) if result.issues_found > 0 => {
                warn!(issues = result.issues_found, "integrity issues after sync")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "post-sync integrity check failed"),
        }
    }

    fn gate(&self) -> SyncResult<()> {
        if let Some(reason) = self.state.lock().halted.clone() {
            return Err(SyncError::Halted { reason });
        }
        if self.migrations.is_running() {
            return Err(CoreError::migration_failed("a migration is running").into());
        }
        self.migrations.ensure_sync_allowed()?;
        Ok(())
    }

    fn evaluate(&self, trigger: SyncTrigger, sync_type: &SyncType) -> Option<DeferReason> {
        let sample: NetworkStateSample = self.network.current();
        if !sample.is_connected {
            return Some(DeferReason::Offline);
        }
        let urgent = sync_type.priority_only();
        if self.config.sync_on_wifi_only && sample.is_metered && !urgent {
            return Some(DeferReason::MeteredConnection);
        }
        if self.config.offline_mode == OfflineMode::Advanced
            && sample.connection_quality == ConnectionQuality::Poor
            && !urgent
        {
            return Some(DeferReason::PoorConnection);
        }
        if matches!(trigger, SyncTrigger::Enqueue | SyncTrigger::Timer) {
            let state = self.state.lock();
            if let Some(until) = state.next_scheduled_sync {
                if state.consecutive_failures > 0 && until > self.clock.now_millis() {
                    return Some(DeferReason::BackingOff { until });
                }
            }
        }
        None
    }

    fn defer(&self, reason: DeferReason) -> SyncResult<()> {
        let now = self.clock.now_millis();
        let next = match reason {
            DeferReason::BackingOff { until } => Some(until),
            _ => self
                .config
                .sync_interval
                .period()
                .map(|p| now + p.as_millis() as u64),
        };
        self.update_state(|state| state.next_scheduled_sync = next)?;
        debug!(?reason, next_scheduled_sync = ?next, "sync deferred");
        Ok(())
    }

    fn record_failure(&self, e: &SyncError) -> SyncResult<()> {
        let now = self.clock.now_millis();
        let backoff = &self.config.failure_backoff;
        let state = self.update_state(|state| {
            state.sync_in_progress = false;
            state.current_sync_type = None;
            state.consecutive_failures += 1;
            state.last_error = Some(e.to_string());
            let delay = backoff.delay_for_attempt(state.consecutive_failures);
            state.next_scheduled_sync = Some(now + delay.as_millis() as u64);
        })?;
        warn!(
            error = %e,
            failures = state.consecutive_failures,
            next_attempt = ?state.next_scheduled_sync,
            "sync cycle failed"
        );
        Ok(())
    }

    fn record_fatal(&self, e: &SyncError) {
        let halts = e.halts();
        let saved = self.update_state(|state| {
            state.sync_in_progress = false;
            state.current_sync_type = None;
            state.last_error = Some(e.to_string());
            if halts {
                state.halted = Some(e.to_string());
            }
        });
        if let Err(save) = saved {
            warn!(error = %save, "failed to persist sync state");
        }
        error!(error = %e, halted = halts, "sync stopped on fatal error");
        self.emit(SyncEvent::Fatal {
            message: e.to_string(),
        });
    }

    async fn sync_body(
        &self,
        sync_type: &SyncType,
        report: &mut SyncReport,
    ) -> SyncResult<Option<InterruptReason>> {
        let sample = self.network.current();
        self.queue
            .set_throughput_hint(sample.bandwidth_kbps, sample.latency_ms);

        let pulls = sync_type.pulls() && self.config.offline_mode.pulls();
        if pulls && sync_type.pulls_first() {
            if let Some(reason) = self.pull(sync_type, report).await? {
                return Ok(Some(reason));
            }
        }
        if let Some(reason) = self.drain(sync_type, report).await? {
            return Ok(Some(reason));
        }
        if pulls && !sync_type.pulls_first() {
            return self.pull(sync_type, report).await;
        }
        Ok(None)
    }

    async fn drain(
        &self,
        sync_type: &SyncType,
        report: &mut SyncReport,
    ) -> SyncResult<Option<InterruptReason>> {
        let filter = BatchFilter::for_sync_type(sync_type);
        let limits = &self.config.queue;
        let mut link = self.network.watch();
        let mut resolved: HashSet<String> = HashSet::new();

        loop {
            if let Some(reason) = self.interruption() {
                return Ok(Some(reason));
            }
            let batch = self.queue.dequeue_batch_filtered(
                limits.max_batch_items,
                limits.max_batch_bytes,
                &filter,
            )?;
            if batch.is_empty() {
                return Ok(None);
            }
            debug!(items = batch.len(), "draining batch");

            let mut blocked: HashSet<EntityRef> = HashSet::new();
            let mut rest = batch.into_iter();
            while let Some(item) = rest.next() {
                let entity = item.entity_ref();
                if blocked.contains(&entity) {
                    self.queue.release(&item.id)?;
                    continue;
                }
                if let Some(reason) = self.interruption() {
                    self.queue.release(&item.id)?;
                    self.release_all(rest)?;
                    return Ok(Some(reason));
                }
                // Acks earlier in the batch may have rebased this item.
                let item = self.queue.get(&item.id).unwrap_or(item);
                match self.deliver(&item, &mut link, &mut resolved, report).await {
                    Ok(Delivery::Applied) => {}
                    Ok(Delivery::Blocked) => {
                        blocked.insert(entity);
                    }
                    Ok(Delivery::Disconnected) => {
                        self.release_all(rest)?;
                        return Ok(Some(InterruptReason::ConnectivityLost));
                    }
                    Err(e) => {
                        self.release_all(rest)?;
                        return Err(e);
                    }
                }
            }
        }
    }

    fn release_all(&self, items: impl Iterator<Item = QueueItem>) -> SyncResult<()> {
        for item in items {
            self.queue.release(&item.id)?;
        }
        Ok(())
    }

    fn interruption(&self) -> Option<InterruptReason> {
        if self.cancel.load(Ordering::SeqCst) {
            Some(InterruptReason::Cancelled)
        } else if !self.network.is_connected() {
            Some(InterruptReason::ConnectivityLost)
        } else {
            None
        }
    }

    async fn call<T>(
        &self,
        link: &mut watch::Receiver<NetworkStateSample>,
        request: impl Future<Output = RemoteResult<T>>,
    ) -> Call<T> {
        tokio::select! {
            biased;
            _ = network::disconnected(link) => Call::Disconnected,
            result = tokio::time::timeout(self.config.per_item_timeout, request) => match result {
                Ok(result) => Call::Done(result),
                Err(_) => Call::TimedOut,
            },
        }
    }

    async fn push_item(&self, item: &QueueItem) -> RemoteResult<RemoteDocument> {
        let collection = item.entity_type.collection();
        let id = item.entity_id.as_str();
        match (item.operation, &item.payload) {
            (Operation::Delete, _) => {
                self.remote
                    .delete_document(collection, id, item.base_version)
                    .await
            }
            (Operation::Update, Some(payload)) if item.base_version.is_some() => {
                self.remote
                    .update_document(collection, id, payload, item.base_version)
                    .await
            }
            // An entity the server never acknowledged is sent as a create.
            (Operation::Create | Operation::Update, Some(payload)) => {
                self.remote.create_document(collection, id, payload).await
            }
            (_, None) => Err(RemoteError::Rejected(format!(
                "queue item {} carries no payload",
                item.id
            ))),
        }
    }

    async fn deliver(
        &self,
        item: &QueueItem,
        link: &mut watch::Receiver<NetworkStateSample>,
        resolved: &mut HashSet<String>,
        report: &mut SyncReport,
    ) -> SyncResult<Delivery> {
        match self.call(link, self.push_item(item)).await {
            Call::Disconnected => {
                self.queue.nack(&item.id, "connectivity lost")?;
                report.retried += 1;
                Ok(Delivery::Disconnected)
            }
            Call::TimedOut => {
                warn!(item = %item.id, entity = %item.entity_ref(), "remote call timed out");
                self.queue.nack(&item.id, "remote call timed out")?;
                report.retried += 1;
                Ok(Delivery::Blocked)
            }
            Call::Done(Ok(doc)) => {
                self.applied(item, Some(&doc))?;
                report.pushed += 1;
                Ok(Delivery::Applied)
            }
            Call::Done(Err(err)) => self.delivery_failed(item, err, resolved, report),
        }
    }

    fn delivery_failed(
        &self,
        item: &QueueItem,
        err: RemoteError,
        resolved: &mut HashSet<String>,
        report: &mut SyncReport,
    ) -> SyncResult<Delivery> {
        match err {
            RemoteError::VersionConflict { current } | RemoteError::AlreadyExists { current } => {
                if !resolved.insert(item.id.clone()) {
                    self.queue
                        .nack(&item.id, "server changed again during resolution")?;
                    report.retried += 1;
                    return Ok(Delivery::Blocked);
                }
                let outcome = self.resolver.resolve(item, &current)?;
                report.conflicts += 1;
                if outcome.action == ResolutionAction::Parked {
                    report.parked += 1;
                }
                self.emit(SyncEvent::ConflictRecorded {
                    conflict_id: outcome.record.id.clone(),
                    entity: item.entity_ref(),
                    resolution: outcome.record.resolution,
                });
                Ok(Delivery::Blocked)
            }
            RemoteError::NotFound { .. } if item.operation == Operation::Delete => {
                self.applied(item, None)?;
                report.pushed += 1;
                Ok(Delivery::Applied)
            }
            RemoteError::NotFound { .. } => {
                debug!(item = %item.id, "document missing remotely; sending as create");
                self.queue.requeue_resolved(
                    &item.id,
                    Rebase {
                        operation: Operation::Create,
                        payload: item.payload.clone(),
                        base_version: None,
                        base_payload: None,
                    },
                )?;
                Ok(Delivery::Blocked)
            }
            RemoteError::Timeout | RemoteError::Rejected(_) => {
                warn!(item = %item.id, error = %err, "delivery failed");
                self.queue.nack(&item.id, &err.to_string())?;
                report.retried += 1;
                Ok(Delivery::Blocked)
            }
            RemoteError::Unavailable(_) => {
                self.queue.nack(&item.id, &err.to_string())?;
                report.retried += 1;
                Err(err.into())
            }
            RemoteError::Unauthorized(_) => {
                self.queue.release(&item.id)?;
                Err(err.into())
            }
        }
    }

    fn applied(&self, item: &QueueItem, doc: Option<&RemoteDocument>) -> SyncResult<()> {
        self.queue.ack(&item.id)?;
        let Some(doc) = doc else {
            return Ok(());
        };
        let entity = item.entity_ref();
        let payload = if doc.deleted { None } else { doc.data.clone() };
        if let Some(mut record) = self.store.get_entity(&entity)? {
            record.synced = Some(SyncedVersion {
                version: doc.version,
                server_timestamp: doc.updated_at,
                payload: payload.clone(),
            });
            self.store.put_entity(&record)?;
        }
        self.queue.rebase_entity(&entity, doc.version, payload)?;
        debug!(item = %item.id, entity = %entity, version = doc.version, "applied remotely");
        Ok(())
    }

    async fn pull(
        &self,
        sync_type: &SyncType,
        report: &mut SyncReport,
    ) -> SyncResult<Option<InterruptReason>> {
        let since = if sync_type.pulls_everything() {
            None
        } else {
            self.state.lock().last_sync_timestamp
        };
        let filter = since.map_or_else(ListFilter::all, ListFilter::since);
        let mut link = self.network.watch();

        for entity_type in EntityType::ALL {
            if !sync_type.includes(entity_type) {
                continue;
            }
            if let Some(reason) = self.interruption() {
                return Ok(Some(reason));
            }
            let collection = entity_type.collection();
            let request = self.remote.list_documents(collection, &filter);
            let docs = match self.call(&mut link, request).await {
                Call::Done(result) => result?,
                Call::TimedOut => return Err(SyncError::timeout(format!("list {collection}"))),
                Call::Disconnected => return Ok(Some(InterruptReason::ConnectivityLost)),
            };
            for doc in &docs {
                if self.apply_remote(entity_type, doc)? {
                    report.pulled += 1;
                }
            }
        }
        Ok(None)
    }

    /// Applies one pulled document. Entities with queued local changes are
    /// left alone; their conflict surfaces when the change is pushed.
    fn apply_remote(&self, entity_type: EntityType, doc: &RemoteDocument) -> SyncResult<bool> {
        if let Err(e) = EntityRef::check_id(&doc.id) {
            warn!(entity_type = %entity_type, error = %e, "skipping remote document");
            return Ok(false);
        }
        let entity = EntityRef::new(entity_type, doc.id.as_str());
        if self.queue.has_items_for(&entity) {
            return Ok(false);
        }
        let local = self.store.get_entity(&entity)?;
        if local
            .as_ref()
            .and_then(EntityRecord::synced_version)
            .is_some_and(|v| v >= doc.version)
        {
            return Ok(false);
        }
        if doc.deleted {
            let removed = self.store.delete_entity(&entity)?;
            if removed {
                debug!(entity = %entity, "removed by remote tombstone");
            }
            return Ok(removed);
        }
        let Some(payload) = doc.data.clone() else {
            warn!(entity = %entity, "remote document has no data");
            return Ok(false);
        };
        if let Err(e) = payload.ensure_type(entity_type) {
            warn!(entity = %entity, error = %e, "remote document has the wrong type");
            return Ok(false);
        }

        let mut record = match local {
            Some(mut record) => {
                record.set_payload(payload.clone(), doc.updated_at)?;
                record
            }
            None => EntityRecord::new(doc.id.as_str(), payload.clone(), doc.updated_at)?,
        };
        record.synced = Some(SyncedVersion {
            version: doc.version,
            server_timestamp: doc.updated_at,
            payload: Some(payload),
        });
        self.store.put_entity(&record)?;
        Ok(true)
    }

    fn update_state(
        &self,
        f: impl FnOnce(&mut SyncStateRecord),
    ) -> SyncResult<SyncStateRecord> {
        let status = self.queue.status();
        let conflicts = self.resolver.unresolved_count();
        let mut state = self.state.lock();
        f(&mut state);
        state.pending_changes = status.pending_items + status.in_flight_items;
        state.failed_items = status.failed_items;
        state.conflicts = conflicts;
        self.store.save_sync_state(&state)?;
        Ok(state.clone())
    }

    fn set_phase(&self, phase: SyncPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "sync phase");
            self.emit(SyncEvent::PhaseChanged(phase));
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
