//! # PawSync Protocol
//!
//! The data model shared by every PawSync crate.
//!
//! This crate provides:
//! - Typed entity payloads (`Dog`, `Feeding`, `HealthEntry`, ...) keyed by [`EntityType`]
//! - Queue records ([`QueueItem`], [`Mutation`], [`QueueStatus`])
//! - Conflict records and resolution policies
//! - Network samples, sync state and integrity check results
//! - CBOR encoding and payload checksums
//!
//! This is a pure data crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod entity;
mod error;
mod integrity;
mod network;
mod operation;
mod remote;
mod state;

pub use codec::{decode, encode, payload_checksum, Checksum};
pub use conflict::{ConflictPolicy, ConflictRecord, ManualChoice, Resolution};
pub use entity::{
    Allergy, Dog, EntityPayload, EntityRef, EntityType, Feeding, FieldMap, HealthEntry,
    Medication, Product, WeightGoal,
};
pub use error::{ProtocolError, ProtocolResult};
pub use integrity::{CheckType, IntegrityCheckResult, IntegrityIssue, IssueKind};
pub use network::{ConnectionQuality, ConnectionType, NetworkStateSample};
pub use operation::{Mutation, Operation, QueueItem, QueueItemStatus, QueueStatus};
pub use remote::{ListFilter, RemoteDocument};
pub use state::{SyncStateRecord, SyncType};

/// Field value inside a [`FieldMap`].
pub use ciborium::Value as FieldValue;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
