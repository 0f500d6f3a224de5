//! Connectivity tracking.
//!
//! The monitor keeps the last known [`NetworkStateSample`] in a `watch`
//! channel so readers never wait, publishes transitions on a `broadcast`
//! channel, and keeps a bounded rolling history. Samples come from a
//! [`NetworkProbe`] polled by [`NetworkMonitor::spawn_sampler`] or are pushed
//! by the host through [`NetworkMonitor::record`].

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use pawsync_core::{LocalStore, SharedClock};
use pawsync_protocol::{ConnectionQuality, ConnectionType, NetworkStateSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// A connectivity transition.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Disconnected to connected.
    Connected(NetworkStateSample),
    /// Connected to disconnected.
    Disconnected(NetworkStateSample),
    /// Quality class changed while connected.
    QualityChanged {
        /// Previous class.
        from: ConnectionQuality,
        /// New class.
        to: ConnectionQuality,
    },
    /// Link type changed while connected.
    ConnectionTypeChanged {
        /// Previous type.
        from: ConnectionType,
        /// New type.
        to: ConnectionType,
    },
}

/// Source of connectivity samples.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Takes one sample.
    async fn sample(&self) -> SyncResult<NetworkStateSample>;
}

/// A probe that reports whatever it was last given.
#[derive(Debug)]
pub struct ManualProbe {
    sample: Mutex<Option<NetworkStateSample>>,
}

impl ManualProbe {
    /// A probe with no sample yet; sampling fails until one is set.
    pub fn new() -> Self {
        Self {
            sample: Mutex::new(None),
        }
    }

    /// Sets the sample returned from now on.
    pub fn set(&self, sample: NetworkStateSample) {
        *self.sample.lock() = Some(sample);
    }
}

impl Default for ManualProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkProbe for ManualProbe {
    async fn sample(&self) -> SyncResult<NetworkStateSample> {
        self.sample
            .lock()
            .clone()
            .ok_or_else(|| SyncError::transient("no sample available"))
    }
}

/// Tracks connectivity.
pub struct NetworkMonitor {
    clock: SharedClock,
    current: watch::Sender<NetworkStateSample>,
    events: broadcast::Sender<NetworkEvent>,
    history: Mutex<VecDeque<NetworkStateSample>>,
    history_len: usize,
    store: Option<Arc<LocalStore>>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("current", &*self.current.borrow())
            .field("history_len", &self.history_len)
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl NetworkMonitor {
    /// A monitor that starts disconnected and keeps `history_len` samples.
    pub fn new(clock: SharedClock, history_len: usize) -> Self {
        let initial = NetworkStateSample::disconnected(clock.now_millis());
        Self {
            clock,
            current: watch::channel(initial).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
            history: Mutex::new(VecDeque::new()),
            history_len: history_len.max(1),
            store: None,
        }
    }

    /// A monitor that persists samples to `store` and starts from the
    /// persisted history.
    pub fn with_store(clock: SharedClock, history_len: usize, store: Arc<LocalStore>) -> Self {
        let mut monitor = Self::new(clock, history_len);
        let persisted = store.network_samples();
        let skip = persisted.len().saturating_sub(monitor.history_len);
        {
            let mut history = monitor.history.lock();
            history.extend(persisted.into_iter().skip(skip));
            if let Some(last) = history.back() {
                monitor.current.send_replace(last.clone());
            }
        }
        monitor.store = Some(store);
        monitor
    }

    /// The last known sample.
    pub fn current(&self) -> NetworkStateSample {
        self.current.borrow().clone()
    }

    /// Whether the last known sample is connected.
    pub fn is_connected(&self) -> bool {
        self.current.borrow().is_connected
    }

    /// A receiver that always holds the latest sample.
    pub fn watch(&self) -> watch::Receiver<NetworkStateSample> {
        self.current.subscribe()
    }

    /// Subscribes to transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Retained samples, oldest first.
    pub fn history(&self) -> Vec<NetworkStateSample> {
        self.history.lock().iter().cloned().collect()
    }

    /// Records a sample and publishes the transitions it causes.
    ///
    /// Persistence is best effort; a failed write is logged and the sample
    /// still becomes current.
    pub fn record(&self, sample: NetworkStateSample) -> Vec<NetworkEvent> {
        let previous = self.current.send_replace(sample.clone());
        let transitions = transitions(&previous, &sample);

        {
            let mut history = self.history.lock();
            history.push_back(sample.clone());
            while history.len() > self.history_len {
                history.pop_front();
            }
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.append_network_sample(&sample) {
                warn!(error = %e, "failed to persist network sample");
            }
        }

        for event in &transitions {
            match event {
                NetworkEvent::Connected(s) => {
                    info!(connection = ?s.connection_type, quality = ?s.connection_quality, "network connected")
                }
                NetworkEvent::Disconnected(_) => info!("network disconnected"),
                other => debug!(event = ?other, "network changed"),
            }
            // No receivers is fine.
            let _ = self.events.send(event.clone());
        }
        transitions
    }

    /// Records a disconnected sample stamped now.
    pub fn mark_disconnected(&self) -> Vec<NetworkEvent> {
        self.record(NetworkStateSample::disconnected(self.clock.now_millis()))
    }

    /// Polls `probe` every `every` until `shutdown` turns true.
    ///
    /// A probe that fails or takes longer than `every` leaves the previous
    /// sample in place.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        probe: Arc<dyn NetworkProbe>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match tokio::time::timeout(every, probe.sample()).await {
                            Ok(Ok(sample)) => {
                                monitor.record(sample);
                            }
                            Ok(Err(e)) => debug!(error = %e, "network probe failed; keeping last sample"),
                            Err(_) => debug!("network probe timed out; keeping last sample"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("network sampler stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn transitions(previous: &NetworkStateSample, next: &NetworkStateSample) -> Vec<NetworkEvent> {
    match (previous.is_connected, next.is_connected) {
        (false, true) => vec![NetworkEvent::Connected(next.clone())],
        (true, false) => vec![NetworkEvent::Disconnected(next.clone())],
        (false, false) => Vec::new(),
        (true, true) => {
            let mut events = Vec::new();
            if previous.connection_type != next.connection_type {
                events.push(NetworkEvent::ConnectionTypeChanged {
                    from: previous.connection_type,
                    to: next.connection_type,
                });
            }
            if previous.connection_quality != next.connection_quality {
                events.push(NetworkEvent::QualityChanged {
                    from: previous.connection_quality,
                    to: next.connection_quality,
                });
            }
            events
        }
    }
}

/// Resolves once `rx` holds a disconnected sample. Never resolves if the
/// monitor is gone.
pub(crate) async fn disconnected(rx: &mut watch::Receiver<NetworkStateSample>) {
    if rx.wait_for(|sample| !sample.is_connected).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawsync_core::ManualClock;

    fn monitor(history: usize) -> NetworkMonitor {
        NetworkMonitor::new(Arc::new(ManualClock::new(1_000)), history)
    }

    fn wifi(kbps: u32, at: u64) -> NetworkStateSample {
        NetworkStateSample::connected(ConnectionType::Wifi, Some(kbps), Some(40), at)
    }

    #[test]
    fn starts_disconnected() {
        let monitor = monitor(4);
        assert!(!monitor.is_connected());
        assert!(monitor.history().is_empty());
    }

    #[test]
    fn emits_transitions() {
        let monitor = monitor(4);
        let mut rx = monitor.subscribe();

        let events = monitor.record(wifi(5_000, 1));
        assert!(matches!(events.as_slice(), [NetworkEvent::Connected(_)]));
        assert!(matches!(rx.try_recv(), Ok(NetworkEvent::Connected(_))));

        let events = monitor.record(wifi(100, 2));
        assert_eq!(
            events,
            vec![NetworkEvent::QualityChanged {
                from: ConnectionQuality::Excellent,
                to: ConnectionQuality::Fair,
            }]
        );
        assert!(monitor.record(wifi(120, 3)).is_empty());

        let events = monitor.mark_disconnected();
        assert!(matches!(events.as_slice(), [NetworkEvent::Disconnected(_)]));
        assert!(!monitor.is_connected());
    }

    #[test]
    fn history_is_bounded() {
        let monitor = monitor(3);
        for t in 0..10 {
            monitor.record(wifi(1_000, t));
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, 7);
        assert_eq!(monitor.current().timestamp, 9);
    }

    #[test]
    fn restores_persisted_samples() {
        let clock: SharedClock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(LocalStore::in_memory().unwrap());
        {
            let monitor = NetworkMonitor::with_store(clock.clone(), 8, store.clone());
            monitor.record(wifi(2_000, 10));
            monitor.record(wifi(2_000, 20));
        }
        let monitor = NetworkMonitor::with_store(clock, 8, store);
        assert!(monitor.is_connected());
        assert_eq!(monitor.current().timestamp, 20);
        assert_eq!(monitor.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_polls_probe() {
        let monitor = Arc::new(monitor(8));
        let probe = Arc::new(ManualProbe::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = monitor.spawn_sampler(probe.clone(), Duration::from_secs(5), stop_rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!monitor.is_connected());

        probe.set(wifi(3_000, 50));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(monitor.is_connected());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_waits_for_loss() {
        let monitor = monitor(4);
        monitor.record(wifi(1_000, 1));
        let mut rx = monitor.watch();
        let wait = disconnected(&mut rx);
        tokio::pin!(wait);
        assert!(futures_poll_once(wait.as_mut()).await.is_none());
        monitor.mark_disconnected();
        wait.await;
    }

    async fn futures_poll_once<F: std::future::Future + Unpin>(f: F) -> Option<F::Output> {
        tokio::time::timeout(Duration::from_millis(10), f).await.ok()
    }
}
