//! # PawSync Sync Engine
//!
//! The asynchronous half of PawSync: everything that talks to the network.
//!
//! This crate provides:
//! - The `RemoteStore` trait and an in-memory remote for tests and demos
//! - A network monitor that never blocks readers
//! - The sync scheduler state machine (evaluate, drain, pull, prune)
//! - A background worker with a cloneable host handle
//!
//! ## Architecture
//!
//! The engine follows a **push-then-pull** model for ordinary cycles:
//! 1. Drain the change queue against the remote store
//! 2. Route version mismatches to the conflict resolver
//! 3. Pull remote changes for entities with no queued local work
//!
//! `Initial` cycles pull first so a fresh device starts from the server's
//! view.
//!
//! ## Key Invariants
//!
//! - At most one cycle is syncing per user
//! - Enqueueing never waits on a running cycle
//! - Losing connectivity interrupts a cycle without losing acknowledged work
//! - Refused credentials halt syncing until the host clears the halt

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod network;
mod remote;
mod scheduler;
mod worker;

pub use error::{ErrorClass, SyncError, SyncResult};
pub use network::{ManualProbe, NetworkEvent, NetworkMonitor, NetworkProbe};
pub use remote::{MemoryRemoteStore, RemoteError, RemoteResult, RemoteStore};
pub use scheduler::{
    CycleOutcome, DeferReason, InterruptReason, SyncEvent, SyncPhase, SyncReport, SyncScheduler,
    SyncTrigger,
};
pub use worker::{spawn_worker, SyncCommand, SyncHandle, SyncWorker};
