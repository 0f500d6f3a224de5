//! Background sync worker.
//!
//! One task owns the trigger loop: host commands, the sync interval,
//! connectivity changes and the retry timer all funnel into
//! [`SyncScheduler::run_cycle`]. Hosts talk to it through a cloneable
//! [`SyncHandle`].

use crate::error::{SyncError, SyncResult};
use crate::network::NetworkEvent;
use crate::scheduler::{SyncEvent, SyncReport, SyncScheduler, SyncTrigger};
use pawsync_protocol::{ConflictRecord, ManualChoice, Mutation, QueueItem, SyncType};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

const COMMAND_CAPACITY: usize = 32;

/// Commands accepted by the worker.
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a cycle now.
    SyncNow {
        /// Cycle type.
        sync_type: SyncType,
        /// Receives the cycle result.
        reply: Option<oneshot::Sender<SyncResult<SyncReport>>>,
    },
    /// A mutation was enqueued.
    Enqueued,
    /// Stop the worker.
    Shutdown,
}

/// The trigger loop.
pub struct SyncWorker {
    scheduler: Arc<SyncScheduler>,
    command_rx: mpsc::Receiver<SyncCommand>,
    network_rx: broadcast::Receiver<NetworkEvent>,
    retry_at: Option<Instant>,
}

impl SyncWorker {
    /// Creates a worker reading `command_rx`.
    pub fn new(scheduler: Arc<SyncScheduler>, command_rx: mpsc::Receiver<SyncCommand>) -> Self {
        let network_rx = scheduler.network().subscribe();
        Self {
            scheduler,
            command_rx,
            network_rx,
            retry_at: None,
        }
    }

    /// Runs until [`SyncCommand::Shutdown`] arrives or every sender is gone.
    pub async fn run(mut self) {
        let period = self.scheduler.config().sync_interval.period();
        let mut ticker = period.map(|p| {
            let mut ticker = tokio::time::interval_at(Instant::now() + p, p);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut network_open = true;
        info!(interval = ?period, "sync worker started");

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SyncCommand::SyncNow { sync_type, reply }) => {
                        let result = self.cycle(SyncTrigger::Explicit, sync_type).await;
                        if let Some(reply) = reply {
                            // The requester may have given up.
                            let _ = reply.send(result);
                        }
                    }
                    Some(SyncCommand::Enqueued) => {
                        if period.is_none() {
                            let _ = self.cycle(SyncTrigger::Enqueue, SyncType::Incremental).await;
                        }
                    }
                    Some(SyncCommand::Shutdown) | None => {
                        info!("sync worker shutting down");
                        break;
                    }
                },

                _ = tick(&mut ticker) => {
                    let _ = self.cycle(SyncTrigger::Timer, SyncType::Incremental).await;
                }

                event = self.network_rx.recv(), if network_open => match event {
                    Ok(NetworkEvent::Connected(_)) => {
                        let _ = self
                            .cycle(SyncTrigger::ConnectivityRegained, SyncType::Incremental)
                            .await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "network events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => network_open = false,
                },

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    let _ = self.cycle(SyncTrigger::Retry, SyncType::Incremental).await;
                }
            }
        }
    }

    async fn cycle(&mut self, trigger: SyncTrigger, sync_type: SyncType) -> SyncResult<SyncReport> {
        let result = self.scheduler.run_cycle(trigger, sync_type).await;
        self.retry_at = match &result {
            Ok(_) => self.scheduler.next_wakeup().map(|d| Instant::now() + d),
            Err(e) => {
                error!(error = %e, "sync worker waiting for the host");
                None
            }
        };
        result
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Host-side handle to a running worker.
#[derive(Clone)]
pub struct SyncHandle {
    scheduler: Arc<SyncScheduler>,
    commands: mpsc::Sender<SyncCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("running", &self.task.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl SyncHandle {
    /// The scheduler behind the worker.
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Enqueues a mutation and wakes the worker.
    pub fn enqueue(&self, mutation: Mutation) -> SyncResult<QueueItem> {
        let item = self.scheduler.enqueue(mutation)?;
        self.notify_enqueued();
        Ok(item)
    }

    /// Tells the worker new work is queued. Never blocks.
    pub fn notify_enqueued(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) =
            self.commands.try_send(SyncCommand::Enqueued)
        {
            debug!("sync worker gone; mutation stays queued");
        }
    }

    /// Runs a cycle of `sync_type` and waits for its report.
    pub async fn request_sync(&self, sync_type: SyncType) -> SyncResult<SyncReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SyncCommand::SyncNow {
                sync_type,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SyncError::WorkerStopped)?;
        response.await.map_err(|_| SyncError::WorkerStopped)?
    }

    /// Stops the running cycle after its in-flight item.
    pub fn cancel_sync(&self) {
        self.scheduler.cancel();
    }

    /// Lifts a fatal halt and asks for a cycle.
    pub fn clear_fatal(&self) -> SyncResult<()> {
        self.scheduler.clear_fatal()?;
        let _ = self.commands.try_send(SyncCommand::SyncNow {
            sync_type: SyncType::Incremental,
            reply: None,
        });
        Ok(())
    }

    /// Settles a parked conflict and wakes the worker for the released item.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ManualChoice,
        resolved_by: &str,
    ) -> SyncResult<ConflictRecord> {
        let record = self
            .scheduler
            .resolve_conflict(conflict_id, choice, resolved_by)?;
        self.notify_enqueued();
        Ok(record)
    }

    /// Subscribes to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.scheduler.subscribe()
    }

    /// Cancels the running cycle and waits for the worker to exit.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.scheduler.cancel();
        // Already stopped is fine.
        let _ = self.commands.send(SyncCommand::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|_| SyncError::WorkerStopped)?;
        }
        Ok(())
    }
}

/// Spawns the worker on the current runtime.
pub fn spawn_worker(scheduler: Arc<SyncScheduler>) -> SyncHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let worker = SyncWorker::new(Arc::clone(&scheduler), command_rx);
    let task = tokio::spawn(worker.run());
    SyncHandle {
        scheduler,
        commands,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMonitor;
    use crate::remote::MemoryRemoteStore;
    use crate::scheduler::CycleOutcome;
    use pawsync_core::{EngineConfig, LocalStore, ManualClock, SyncInterval};
    use pawsync_protocol::{ConnectionType, EntityPayload, Feeding, NetworkStateSample};
    use std::time::Duration;

    fn feeding(grams: u32) -> EntityPayload {
        EntityPayload::Feeding(Feeding {
            dog_id: "rex".into(),
            product_id: None,
            amount_grams: grams,
            fed_at: 0,
            notes: None,
        })
    }

    fn wifi() -> NetworkStateSample {
        NetworkStateSample::connected(ConnectionType::Wifi, Some(5_000), Some(20), 1)
    }

    fn scheduler(config: EngineConfig, online: bool) -> Arc<SyncScheduler> {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let remote = Arc::new(MemoryRemoteStore::new(clock.clone()));
        let network = Arc::new(NetworkMonitor::new(clock.clone(), 8));
        if online {
            network.record(wifi());
        }
        let scheduler = SyncScheduler::open(config, store, remote, network, clock).unwrap();
        scheduler.migrations().migrate_to_latest().unwrap();
        Arc::new(scheduler)
    }

    async fn next_report(events: &mut broadcast::Receiver<SyncEvent>) -> SyncReport {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                if let SyncEvent::CycleFinished(report) = events.recv().await.unwrap() {
                    return report;
                }
            }
        })
        .await
        .expect("no cycle finished")
    }

    #[tokio::test(start_paused = true)]
    async fn request_sync_and_shutdown() {
        let handle = spawn_worker(scheduler(EngineConfig::default(), true));
        handle
            .scheduler()
            .enqueue(Mutation::create("1", feeding(90)))
            .unwrap();

        let report = handle.request_sync(SyncType::Full).await.unwrap();
        assert_eq!(report.trigger, SyncTrigger::Explicit);
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.pushed, 1);

        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.request_sync(SyncType::Full).await,
            Err(SyncError::WorkerStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_triggers_sync_on_change() {
        let handle = spawn_worker(scheduler(EngineConfig::default(), true));
        let mut events = handle.subscribe();

        handle.enqueue(Mutation::create("1", feeding(90))).unwrap();
        let report = next_report(&mut events).await;
        assert_eq!(report.trigger, SyncTrigger::Enqueue);
        assert_eq!(report.pushed, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_drains_deferred_work() {
        let handle = spawn_worker(scheduler(EngineConfig::default(), false));
        let mut events = handle.subscribe();

        handle.enqueue(Mutation::create("1", feeding(90))).unwrap();
        let report = next_report(&mut events).await;
        assert!(matches!(report.outcome, CycleOutcome::Deferred(_)));

        handle.scheduler().network().record(wifi());
        let report = next_report(&mut events).await;
        assert_eq!(report.trigger, SyncTrigger::ConnectivityRegained);
        assert_eq!(report.pushed, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_mode_waits_for_timer() {
        let config = EngineConfig {
            sync_interval: SyncInterval::Every { secs: 60 },
            ..EngineConfig::default()
        };
        let handle = spawn_worker(scheduler(config, true));
        let mut events = handle.subscribe();

        let started = Instant::now();
        handle.enqueue(Mutation::create("1", feeding(90))).unwrap();
        let report = next_report(&mut events).await;
        assert_eq!(report.trigger, SyncTrigger::Timer);
        assert_eq!(report.pushed, 1);
        assert!(started.elapsed() >= Duration::from_secs(60));
        handle.shutdown().await.unwrap();
    }
}
