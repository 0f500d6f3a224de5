//! # PawSync Storage
//!
//! Byte-store backends underneath the PawSync local replica.
//!
//! Backends are **opaque, append-only byte stores**. They know nothing about
//! records, keyspaces or checksums; `pawsync_core` owns the log format and
//! replays it into its in-memory index on open.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and throwaway replicas
//! - [`FileBackend`] - For the on-device replica file
//!
//! ## Example
//!
//! ```rust
//! use pawsync_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"feeding").unwrap();
//! assert_eq!(backend.read_at(offset, 7).unwrap(), b"feeding");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
