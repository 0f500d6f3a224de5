//! # PawSync Core
//!
//! The synchronous half of the PawSync offline-first engine.
//!
//! This crate provides:
//! - A local store: keyspaced, CRC-framed record log with a capacity limit
//! - The change queue: durable outbox of local mutations with per-entity ordering
//! - Conflict resolution driven by a per-type, per-field strategy table
//! - Integrity checks with repair
//! - Schema migrations with a resumable ledger
//!
//! ## Key Invariants
//!
//! - Items for one entity are delivered in `(local_timestamp, seq)` order
//! - An acknowledged item is never handed out again
//! - A conflict record is terminal once resolved
//! - Only `Repair` integrity checks change data
//! - Sync is refused until every migration step has been applied
//!
//! Every component is internally locked and shared behind an `Arc`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod conflict;
mod error;
mod integrity;
mod migration;
mod queue;
mod store;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    EngineConfig, OfflineMode, QueueConfig, RetentionPolicy, RetryConfig, StoreConfig,
    SyncInterval,
};
pub use conflict::{
    ConflictFilter, ConflictResolver, FieldRule, PolicyTable, ResolutionAction, ResolutionOutcome,
};
pub use error::{CoreError, CoreResult};
pub use integrity::{IntegrityChecker, DEFAULT_RESULTS_KEPT};
pub use migration::{
    AppliedMigration, BackfillPayloadChecksums, FailedMigration, InitializeSyncState, Migration,
    MigrationContext, MigrationInfo, MigrationLedger, MigrationOperation, MigrationResult,
    MigrationRunner, MigrationStatus, MigrationVersion, NormalizeEntityKeys, StepResult,
    LATEST_SCHEMA_VERSION,
};
pub use queue::{BatchFilter, ChangeQueue, Rebase};
pub use store::{
    compute_crc32, normalize_entity_key, EntityRecord, Frame, FrameFlags, Keyspace, LocalStore,
    ReplayError, StoreStats, SyncedVersion, META_MIGRATION_LEDGER, META_QUICK_WATERMARK,
};
