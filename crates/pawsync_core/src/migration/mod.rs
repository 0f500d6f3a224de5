//! Schema migrations for the local store.
//!
//! Migrations are ordered steps keyed by version. The runner applies the
//! steps between two versions, persisting a ledger entry after every step, so
//! a failed run halts at the last good step and a rerun resumes at the step
//! that failed. Steps must be idempotent.
//!
//! ```ignore
//! let runner = MigrationRunner::with_builtin(store, clock, "user-1")?;
//! let result = runner.migrate_to_latest()?;
//! assert!(result.is_success());
//! ```

mod steps;

pub use steps::{
    BackfillPayloadChecksums, InitializeSyncState, NormalizeEntityKeys, LATEST_SCHEMA_VERSION,
};

use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::store::{Keyspace, LocalStore, META_MIGRATION_LEDGER};
use pawsync_protocol::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Version number for migrations.
pub type MigrationVersion = u64;

/// Information about a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Version number.
    pub version: MigrationVersion,
    /// Name.
    pub name: String,
    /// What the step does.
    pub description: Option<String>,
}

/// Something a step did, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOperation {
    /// Records rewritten in place.
    Rewrote {
        /// Keyspace name.
        keyspace: &'static str,
        /// Number of records.
        count: usize,
    },
    /// Records moved to a new key.
    Moved {
        /// Keyspace name.
        keyspace: &'static str,
        /// Number of records.
        count: usize,
    },
    /// Anything else.
    Custom {
        /// Description of the operation.
        description: String,
    },
}

/// Handed to [`Migration::up`].
#[derive(Debug)]
pub struct MigrationContext<'a> {
    store: &'a LocalStore,
    /// Schema version before this step.
    pub current_version: MigrationVersion,
    /// What the step did.
    pub operations: Vec<MigrationOperation>,
}

impl<'a> MigrationContext<'a> {
    fn new(store: &'a LocalStore, current_version: MigrationVersion) -> Self {
        Self {
            store,
            current_version,
            operations: Vec::new(),
        }
    }

    /// The store being migrated.
    pub fn store(&self) -> &LocalStore {
        self.store
    }

    /// Records rewritten records.
    pub fn rewrote(&mut self, keyspace: Keyspace, count: usize) {
        self.operations.push(MigrationOperation::Rewrote {
            keyspace: keyspace.name(),
            count,
        });
    }

    /// Records moved records.
    pub fn moved(&mut self, keyspace: Keyspace, count: usize) {
        self.operations.push(MigrationOperation::Moved {
            keyspace: keyspace.name(),
            count,
        });
    }

    /// Records a custom operation.
    pub fn custom(&mut self, description: &str) {
        self.operations.push(MigrationOperation::Custom {
            description: description.to_string(),
        });
    }
}

/// A migration step.
pub trait Migration: Send + Sync {
    /// Version this step brings the store to. Unique, sequential from 1.
    fn version(&self) -> MigrationVersion;

    /// Name.
    fn name(&self) -> &str;

    /// Optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Applies the step. Must be idempotent.
    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()>;
}

/// A step recorded as applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Version number.
    pub version: MigrationVersion,
    /// Name.
    pub name: String,
    /// When it was applied.
    pub applied_at: Timestamp,
}

/// The step a run halted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMigration {
    /// Version number.
    pub version: MigrationVersion,
    /// Name.
    pub name: String,
    /// Error message.
    pub error: String,
    /// When it failed.
    pub failed_at: Timestamp,
}

/// Persisted migration state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationLedger {
    /// Highest applied version.
    pub current_version: MigrationVersion,
    /// Applied steps.
    pub applied: Vec<AppliedMigration>,
    /// Step the last run halted at, cleared on success.
    pub failed: Option<FailedMigration>,
}

impl MigrationLedger {
    /// Whether a version was applied.
    pub fn is_applied(&self, version: MigrationVersion) -> bool {
        self.applied.iter().any(|m| m.version == version)
    }

    fn record(&mut self, version: MigrationVersion, name: &str, applied_at: Timestamp) {
        if !self.is_applied(version) {
            self.applied.push(AppliedMigration {
                version,
                name: name.to_string(),
                applied_at,
            });
            self.current_version = self.current_version.max(version);
        }
        if self.failed.as_ref().is_some_and(|f| f.version == version) {
            self.failed = None;
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// Version number.
    pub version: MigrationVersion,
    /// Name.
    pub name: String,
    /// Whether the step succeeded.
    pub success: bool,
    /// Error message on failure.
    pub error: Option<String>,
    /// What the step did.
    pub operations: Vec<MigrationOperation>,
}

/// Result of [`MigrationRunner::migrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    /// Version before the run.
    pub from_version: MigrationVersion,
    /// Version after the run.
    pub final_version: MigrationVersion,
    /// Steps attempted, in order.
    pub steps: Vec<StepResult>,
    /// Steps applied.
    pub applied_count: usize,
}

impl MigrationResult {
    /// Whether every attempted step succeeded.
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }

    /// The step the run halted at.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| !s.success)
    }
}

/// Summary for hosts and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Applied version.
    pub current_version: MigrationVersion,
    /// Highest registered version.
    pub latest_version: MigrationVersion,
    /// Steps not yet applied.
    pub pending: Vec<MigrationInfo>,
    /// Step the last run halted at.
    pub failed: Option<FailedMigration>,
    /// Whether a run is in progress.
    pub running: bool,
}

/// Applies migrations to a local store.
pub struct MigrationRunner {
    store: Arc<LocalStore>,
    clock: SharedClock,
    migrations: BTreeMap<MigrationVersion, Box<dyn Migration>>,
    running: AtomicBool,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("versions", &self.migrations.keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish()
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MigrationRunner {
    /// A runner with no steps.
    pub fn new(store: Arc<LocalStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            migrations: BTreeMap::new(),
            running: AtomicBool::new(false),
        }
    }

    /// A runner with the engine's own steps.
    pub fn with_builtin(
        store: Arc<LocalStore>,
        clock: SharedClock,
        user_id: impl Into<String>,
    ) -> CoreResult<Self> {
        let mut runner = Self::new(store, clock);
        runner.register(Box::new(InitializeSyncState::new(user_id)))?;
        runner.register(Box::new(BackfillPayloadChecksums))?;
        runner.register(Box::new(NormalizeEntityKeys))?;
        Ok(runner)
    }

    /// Registers a step.
    ///
    /// # Errors
    ///
    /// Fails if the version is already registered.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> CoreResult<()> {
        let version = migration.version();
        if self.migrations.contains_key(&version) {
            return Err(CoreError::migration_failed(format!(
                "migration version {version} already registered"
            )));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Checks that versions run 1, 2, 3... with no gaps.
    pub fn validate(&self) -> CoreResult<()> {
        for (i, version) in self.migrations.keys().enumerate() {
            let expected = (i + 1) as u64;
            if *version != expected {
                return Err(CoreError::migration_failed(format!(
                    "migration version gap: expected {expected}, got {version}"
                )));
            }
        }
        Ok(())
    }

    /// Registered steps.
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| info_of(m.as_ref())).collect()
    }

    /// Highest registered version.
    pub fn latest_version(&self) -> MigrationVersion {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// The persisted ledger.
    pub fn ledger(&self) -> CoreResult<MigrationLedger> {
        Ok(self
            .store
            .get_typed(Keyspace::Meta, META_MIGRATION_LEDGER)?
            .unwrap_or_default())
    }

    fn save_ledger(&self, ledger: &MigrationLedger) -> CoreResult<()> {
        self.store.put_typed(Keyspace::Meta, META_MIGRATION_LEDGER, ledger)?;
        Ok(())
    }

    /// Unapplied steps with versions in `(from, to]`.
    pub fn pending(&self, from: MigrationVersion, to: MigrationVersion) -> CoreResult<Vec<MigrationInfo>> {
        let ledger = self.ledger()?;
        Ok(self
            .migrations
            .range(from.saturating_add(1)..=to)
            .filter(|(v, _)| !ledger.is_applied(**v))
            .map(|(_, m)| info_of(m.as_ref()))
            .collect())
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current state.
    pub fn status(&self) -> CoreResult<MigrationStatus> {
        let ledger = self.ledger()?;
        let latest = self.latest_version();
        Ok(MigrationStatus {
            current_version: ledger.current_version,
            latest_version: latest,
            pending: self.pending(0, latest)?,
            failed: ledger.failed,
            running: self.is_running(),
        })
    }

    /// Fails unless the store is fully migrated.
    ///
    /// # Errors
    ///
    /// [`CoreError::SchemaTooNew`] if the store was written by a newer
    /// engine, [`CoreError::MigrationFailed`] while steps are pending.
    pub fn ensure_sync_allowed(&self) -> CoreResult<()> {
        let ledger = self.ledger()?;
        let latest = self.latest_version();
        if ledger.current_version > latest {
            return Err(CoreError::SchemaTooNew {
                found: ledger.current_version,
                supported: latest,
            });
        }
        if let Some(failed) = &ledger.failed {
            return Err(CoreError::migration_failed(format!(
                "step {} ({}) failed: {}",
                failed.version, failed.name, failed.error
            )));
        }
        let pending = self.pending(0, latest)?;
        if let Some(first) = pending.first() {
            return Err(CoreError::migration_failed(format!(
                "{} step(s) pending, starting at {} ({})",
                pending.len(),
                first.version,
                first.name
            )));
        }
        Ok(())
    }

    /// Whether sync must wait: a run is in progress or
    /// [`ensure_sync_allowed`](Self::ensure_sync_allowed) fails.
    pub fn is_sync_blocked(&self) -> bool {
        self.is_running() || self.ensure_sync_allowed().is_err()
    }

    /// Applies the unapplied steps in `(from, to]`, in order.
    ///
    /// `from` must be the version the ledger is at. A failing step halts the
    /// run; the ledger records it and the result reports it. A rerun from the
    /// reported `final_version` resumes at the failed step.
    ///
    /// # Errors
    ///
    /// Fails if another run is in progress, `to` is not registered, the
    /// ledger is newer than this engine, or `from` is not the ledger version
    /// or lies past `to`.
    pub fn migrate(&self, from: MigrationVersion, to: MigrationVersion) -> CoreResult<MigrationResult> {
        if to > self.latest_version() {
            return Err(CoreError::migration_failed(format!(
                "target version {to} is not registered (latest is {})",
                self.latest_version()
            )));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::invalid_operation("a migration is already running"));
        }
        let _guard = RunningGuard(&self.running);

        let mut ledger = self.ledger()?;
        if ledger.current_version > self.latest_version() {
            return Err(CoreError::SchemaTooNew {
                found: ledger.current_version,
                supported: self.latest_version(),
            });
        }

        if from != ledger.current_version {
            return Err(CoreError::invalid_operation(format!(
                "migration requested from version {from}, but the store is at {}",
                ledger.current_version
            )));
        }
        if from > to {
            return Err(CoreError::invalid_operation(format!(
                "cannot migrate down from {from} to {to}"
            )));
        }

        let from_version = ledger.current_version;
        let mut steps = Vec::new();
        let mut applied_count = 0;

        for (version, migration) in self.migrations.range(from.saturating_add(1)..=to) {
            if ledger.is_applied(*version) {
                continue;
            }
            let mut ctx = MigrationContext::new(&self.store, ledger.current_version);
            let outcome = migration.up(&mut ctx);
            let now = self.clock.now_millis();

            match outcome {
                Ok(()) => {
                    ledger.record(*version, migration.name(), now);
                    self.save_ledger(&ledger)?;
                    applied_count += 1;
                    info!(version, name = migration.name(), operations = ?ctx.operations, "migration applied");
                    steps.push(StepResult {
                        version: *version,
                        name: migration.name().to_string(),
                        success: true,
                        error: None,
                        operations: ctx.operations,
                    });
                }
                Err(e) => {
                    ledger.failed = Some(FailedMigration {
                        version: *version,
                        name: migration.name().to_string(),
                        error: e.to_string(),
                        failed_at: now,
                    });
                    self.save_ledger(&ledger)?;
                    error!(version, name = migration.name(), "migration failed: {e}");
                    steps.push(StepResult {
                        version: *version,
                        name: migration.name().to_string(),
                        success: false,
                        error: Some(e.to_string()),
                        operations: ctx.operations,
                    });
                    break;
                }
            }
        }

        Ok(MigrationResult {
            from_version,
            final_version: ledger.current_version,
            steps,
            applied_count,
        })
    }

    /// Applies every pending step.
    pub fn migrate_to_latest(&self) -> CoreResult<MigrationResult> {
        let from = self.ledger()?.current_version;
        self.migrate(from, self.latest_version())
    }
}

fn info_of(m: &dyn Migration) -> MigrationInfo {
    MigrationInfo {
        version: m.version(),
        name: m.name().to_string(),
        description: m.description().map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    struct Step {
        version: u64,
        runs: Arc<AtomicUsize>,
        fail_first: AtomicBool,
    }

    impl Step {
        fn new(version: u64, fail_first: bool) -> (Self, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            let step = Self {
                version,
                runs: runs.clone(),
                fail_first: AtomicBool::new(fail_first),
            };
            (step, runs)
        }
    }

    impl Migration for Step {
        fn version(&self) -> u64 {
            self.version
        }

        fn name(&self) -> &str {
            "step"
        }

        fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(CoreError::migration_failed("disk hiccup"));
            }
            ctx.custom("ran");
            Ok(())
        }
    }

    fn runner() -> MigrationRunner {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        MigrationRunner::new(store, Arc::new(ManualClock::new(100)))
    }

    #[test]
    fn failed_step_halts_and_rerun_resumes() {
        let mut runner = runner();
        let (s1, runs1) = Step::new(1, false);
        let (s2, runs2) = Step::new(2, true);
        let (s3, runs3) = Step::new(3, false);
        runner.register(Box::new(s1)).unwrap();
        runner.register(Box::new(s2)).unwrap();
        runner.register(Box::new(s3)).unwrap();

        let first = runner.migrate(0, 3).unwrap();
        assert!(!first.is_success());
        assert_eq!(first.final_version, 1);
        assert_eq!(first.failed_step().map(|s| s.version), Some(2));
        assert_eq!(runs3.load(Ordering::SeqCst), 0);
        assert!(runner.ensure_sync_allowed().is_err());
        assert_eq!(runner.ledger().unwrap().failed.map(|f| f.version), Some(2));

        assert!(matches!(
            runner.migrate(0, 3),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(runs1.load(Ordering::SeqCst), 1);

        let second = runner.migrate(first.final_version, 3).unwrap();
        assert!(second.is_success());
        assert_eq!(second.steps.first().map(|s| s.version), Some(2));
        assert_eq!(second.final_version, 3);
        assert_eq!(runs1.load(Ordering::SeqCst), 1);
        assert_eq!(runs2.load(Ordering::SeqCst), 2);
        assert_eq!(runs3.load(Ordering::SeqCst), 1);
        assert!(runner.ensure_sync_allowed().is_ok());
        assert!(runner.ledger().unwrap().failed.is_none());
    }

    #[test]
    fn partial_target_leaves_later_steps_pending() {
        let mut runner = runner();
        for v in 1..=3 {
            runner.register(Box::new(Step::new(v, false).0)).unwrap();
        }
        runner.migrate(0, 2).unwrap();
        let status = runner.status().unwrap();
        assert_eq!(status.current_version, 2);
        assert_eq!(status.pending.len(), 1);
        assert!(matches!(
            runner.ensure_sync_allowed(),
            Err(CoreError::MigrationFailed { .. })
        ));
    }

    #[test]
    fn from_version_must_match_the_ledger() {
        let mut runner = runner();
        for v in 1..=3 {
            runner.register(Box::new(Step::new(v, false).0)).unwrap();
        }
        assert!(matches!(
            runner.migrate(1, 3),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(runner.ledger().unwrap().current_version, 0);

        let result = runner.migrate(0, 2).unwrap();
        assert_eq!((result.from_version, result.final_version), (0, 2));
        assert!(matches!(
            runner.migrate(2, 1),
            Err(CoreError::InvalidOperation { .. })
        ));

        let rest = runner.migrate_to_latest().unwrap();
        assert_eq!((rest.from_version, rest.final_version), (2, 3));
        assert_eq!(rest.applied_count, 1);
        assert!(!runner.is_running());
    }

    #[test]
    fn duplicate_and_gap_detection() {
        let mut runner = runner();
        runner.register(Box::new(Step::new(1, false).0)).unwrap();
        assert!(runner.register(Box::new(Step::new(1, false).0)).is_err());
        runner.register(Box::new(Step::new(3, false).0)).unwrap();
        assert!(runner.validate().is_err());
        assert!(runner.migrate(0, 4).is_err());
    }

    #[test]
    fn newer_ledger_is_rejected() {
        let mut runner = runner();
        runner.register(Box::new(Step::new(1, false).0)).unwrap();
        runner
            .save_ledger(&MigrationLedger {
                current_version: 7,
                ..MigrationLedger::default()
            })
            .unwrap();
        assert!(matches!(
            runner.ensure_sync_allowed(),
            Err(CoreError::SchemaTooNew { found: 7, supported: 1 })
        ));
        assert!(matches!(
            runner.migrate(0, 1),
            Err(CoreError::SchemaTooNew { .. })
        ));
        assert!(!runner.is_running());
    }
}
