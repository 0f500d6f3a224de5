//! CLI command implementations.

pub mod compact;
pub mod conflicts;
pub mod inspect;
pub mod migrate;
pub mod queue;
pub mod verify;

use pawsync_core::{system_clock, ChangeQueue, LocalStore, QueueConfig, SharedClock, StoreConfig};
use std::path::Path;
use std::sync::Arc;

/// An opened store with the clock commands share.
pub struct Session {
    /// The store.
    pub store: Arc<LocalStore>,
    /// Wall clock.
    pub clock: SharedClock,
}

impl Session {
    /// Opens the store at `path`. The file must exist.
    pub fn open(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Err(format!("No store found at {:?}", path).into());
        }
        let store = LocalStore::open_file(path, StoreConfig::default())?;
        Ok(Self {
            store: Arc::new(store),
            clock: system_clock(),
        })
    }

    /// Loads the change queue.
    pub fn queue(&self) -> Result<Arc<ChangeQueue>, Box<dyn std::error::Error>> {
        let queue = ChangeQueue::open(
            Arc::clone(&self.store),
            QueueConfig::default(),
            Arc::clone(&self.clock),
        )?;
        Ok(Arc::new(queue))
    }
}

pub(crate) fn format_timestamp(ms: u64) -> String {
    format!("{}.{:03}s since epoch", ms / 1000, ms % 1000)
}
