//! Engine configuration.
//!
//! All structs derive `serde` so the host application can hand the engine a
//! JSON document; missing fields fall back to [`Default`].

use pawsync_protocol::{ConflictPolicy, EntityType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How much the app relies on the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineMode {
    /// Writes need connectivity; the queue only smooths over a single request.
    Disabled,
    /// Local writes are queued and pushed; remote data is not pulled.
    Basic,
    /// Queue plus a full pulled replica.
    #[default]
    Full,
    /// `Full` plus a quick integrity check after every successful cycle.
    Advanced,
}

impl OfflineMode {
    /// Whether cycles pull remote changes.
    pub fn pulls(&self) -> bool {
        matches!(self, OfflineMode::Full | OfflineMode::Advanced)
    }

    /// Whether writes are accepted while disconnected.
    pub fn accepts_offline_writes(&self) -> bool {
        !matches!(self, OfflineMode::Disabled)
    }
}

/// When the scheduler evaluates automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncInterval {
    /// After every enqueue and on reconnect.
    #[default]
    OnChange,
    /// On a fixed timer, plus reconnects.
    Every {
        /// Seconds between evaluations.
        secs: u64,
    },
}

impl SyncInterval {
    /// The timer period, if any.
    pub fn period(&self) -> Option<Duration> {
        match self {
            SyncInterval::OnChange => None,
            SyncInterval::Every { secs } => Some(Duration::from_secs((*secs).max(1))),
        }
    }
}

/// How long housekeeping data is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Age after which resolved conflict records are pruned.
    pub resolved_conflicts_secs: u64,
    /// Age after which persisted network samples are pruned.
    pub network_samples_secs: u64,
    /// Samples kept in the monitor's in-memory history.
    pub network_history_len: usize,
    /// Integrity results kept in the log.
    pub integrity_results_kept: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            resolved_conflicts_secs: 30 * 24 * 60 * 60,
            network_samples_secs: 24 * 60 * 60,
            network_history_len: 64,
            integrity_results_kept: 20,
        }
    }
}

/// Change queue limits and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts before an item moves to `Failed`.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Longest retry delay.
    pub backoff_cap: Duration,
    /// Items per drained batch.
    pub max_batch_items: usize,
    /// Payload bytes per drained batch.
    pub max_batch_bytes: u64,
    /// Payload bytes the queue may hold.
    pub capacity_bytes: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(5 * 60),
            max_batch_items: 50,
            max_batch_bytes: 256 * 1024,
            capacity_bytes: 32 * 1024 * 1024,
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }

    /// Sets the attempt limit.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the batch limits.
    #[must_use]
    pub const fn batch_limits(mut self, items: usize, bytes: u64) -> Self {
        self.max_batch_items = items;
        self.max_batch_bytes = bytes;
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub const fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }
}

/// Cycle-level retry after a failed sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed cycles tolerated before the delay stops growing.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Longest delay.
    pub max_delay: Duration,
    /// Growth factor.
    pub backoff_multiplier: f64,
    /// Adds up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay after `failures` consecutive failed cycles.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.min(self.max_attempts.max(1)).saturating_sub(1);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent as i32);
        let secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(secs + jitter)
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Local store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Live bytes the store may hold.
    pub capacity_bytes: u64,
    /// Flush the backend after every write.
    pub sync_on_write: bool,
    /// Log size below which the store is never compacted automatically.
    pub compact_min_log_bytes: u64,
    /// Share of the log, in percent, that must be dead frames before an
    /// automatic compaction.
    pub compact_dead_percent: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            sync_on_write: true,
            compact_min_log_bytes: 1024 * 1024,
            compact_dead_percent: 50,
        }
    }
}

impl StoreConfig {
    /// Sets the capacity.
    #[must_use]
    pub const fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Sets whether every write is flushed.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets when automatic compaction kicks in.
    #[must_use]
    pub const fn compaction(mut self, min_log_bytes: u64, dead_percent: u8) -> Self {
        self.compact_min_log_bytes = min_log_bytes;
        self.compact_dead_percent = dead_percent;
        self
    }
}

/// Everything the host configures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Owner of the replica; keys the sync state singleton.
    pub user_id: String,
    /// Offline capability.
    pub offline_mode: OfflineMode,
    /// Refuse to sync over metered or non-wifi links.
    pub sync_on_wifi_only: bool,
    /// Automatic evaluation schedule.
    pub sync_interval: SyncInterval,
    /// Default conflict policy.
    pub conflict_resolution: ConflictPolicy,
    /// Per-type policy overrides.
    pub type_policies: BTreeMap<EntityType, ConflictPolicy>,
    /// Housekeeping.
    pub retention: RetentionPolicy,
    /// Queue limits.
    pub queue: QueueConfig,
    /// Store limits.
    pub store: StoreConfig,
    /// Timeout for each remote call of a drain.
    pub per_item_timeout: Duration,
    /// Backoff between failed cycles.
    pub failure_backoff: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: "local".into(),
            offline_mode: OfflineMode::default(),
            sync_on_wifi_only: false,
            sync_interval: SyncInterval::default(),
            conflict_resolution: ConflictPolicy::LastWriteWins,
            type_policies: BTreeMap::new(),
            retention: RetentionPolicy::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            per_item_timeout: Duration::from_secs(30),
            failure_backoff: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration for `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Sets the offline mode.
    #[must_use]
    pub fn with_offline_mode(mut self, mode: OfflineMode) -> Self {
        self.offline_mode = mode;
        self
    }

    /// Restricts sync to unmetered wifi or ethernet.
    #[must_use]
    pub fn with_wifi_only(mut self, wifi_only: bool) -> Self {
        self.sync_on_wifi_only = wifi_only;
        self
    }

    /// Sets the evaluation schedule.
    #[must_use]
    pub fn with_sync_interval(mut self, interval: SyncInterval) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the default conflict policy.
    #[must_use]
    pub fn with_conflict_resolution(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_resolution = policy;
        self
    }

    /// Overrides the policy for one entity type.
    #[must_use]
    pub fn with_type_policy(mut self, entity_type: EntityType, policy: ConflictPolicy) -> Self {
        self.type_policies.insert(entity_type, policy);
        self
    }

    /// Sets the queue configuration.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the per-item timeout.
    #[must_use]
    pub fn with_per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = timeout;
        self
    }

    /// Sets the cycle failure backoff.
    #[must_use]
    pub fn with_failure_backoff(mut self, retry: RetryConfig) -> Self {
        self.failure_backoff = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_backoff_doubles_and_caps() {
        let config = QueueConfig::default();
        assert_eq!(config.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(9), Duration::from_secs(300));
        assert_eq!(config.backoff_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn retry_delay_respects_max() {
        let retry = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(7), Duration::from_secs(5));

        let jittered = retry.with_jitter(true).delay_for_attempt(1);
        assert!(jittered >= Duration::from_secs(1));
        assert!(jittered <= Duration::from_millis(1250));
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new("owner-1")
            .with_wifi_only(true)
            .with_sync_interval(SyncInterval::Every { secs: 60 })
            .with_type_policy(EntityType::Dog, ConflictPolicy::ServerWins)
            .with_queue(QueueConfig::default().max_attempts(3).batch_limits(10, 1024));

        assert_eq!(config.user_id, "owner-1");
        assert!(config.sync_on_wifi_only);
        assert_eq!(config.sync_interval.period(), Some(Duration::from_secs(60)));
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.max_batch_items, 10);
        assert_eq!(config.type_policies[&EntityType::Dog], ConflictPolicy::ServerWins);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{
            "user_id": "owner-2",
            "offline_mode": "basic",
            "sync_interval": { "every": { "secs": 120 } },
            "conflict_resolution": "merge",
            "type_policies": { "medication": "manual_review" },
            "queue": { "max_attempts": 7 }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.offline_mode, OfflineMode::Basic);
        assert!(!config.offline_mode.pulls());
        assert_eq!(config.sync_interval, SyncInterval::Every { secs: 120 });
        assert_eq!(config.conflict_resolution, ConflictPolicy::Merge);
        assert_eq!(
            config.type_policies[&EntityType::Medication],
            ConflictPolicy::ManualReview
        );
        assert_eq!(config.queue.max_attempts, 7);
        assert_eq!(config.queue.backoff_base, Duration::from_secs(2));
        assert_eq!(config.per_item_timeout, Duration::from_secs(30));
    }
}
